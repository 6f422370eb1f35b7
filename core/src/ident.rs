use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{Result, TaskError};

/// Length of a task id: 4 digest bytes as lowercase hex.
pub const TASK_ID_LEN: usize = 8;

/// Derive the deterministic id for a task.
///
/// The id is the first 4 bytes of `SHA-256(title ‖ created_at_secs)`
/// hex-encoded, where the creation time contributes its epoch second
/// as 8 little-endian bytes. The same `(title, second)` pair always
/// derives the same id; creation fails on collision and the caller is
/// free to retry.
///
/// ```rust
/// use foreman_core::ident::derive_task_id;
/// use foreman_core::models::now_secs;
///
/// let now = now_secs();
/// let id = derive_task_id("Fix the flaky import", now);
/// assert_eq!(id.len(), 8);
/// assert_eq!(id, derive_task_id("Fix the flaky import", now));
/// ```
pub fn derive_task_id(title: &str, created_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(created_at.timestamp().to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..TASK_ID_LEN / 2])
}

/// Check that `id` is an 8-character lowercase hex task id.
pub fn validate_task_id(id: &str) -> Result<()> {
    let well_formed = id.len() == TASK_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(TaskError::InvalidId(id.to_string()))
    }
}

/// Check that a task title is non-empty after trimming.
pub fn validate_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        Err(TaskError::empty_field("title"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_derivation_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 11, 3, 12, 0, 0).unwrap();
        let a = derive_task_id("Write the exporter", at);
        let b = derive_task_id("Write the exporter", at);
        assert_eq!(a, b);
        assert!(validate_task_id(&a).is_ok());
    }

    #[test]
    fn test_derivation_varies_by_title_and_time() {
        let at = Utc.with_ymd_and_hms(2024, 11, 3, 12, 0, 0).unwrap();
        let base = derive_task_id("Write the exporter", at);
        assert_ne!(base, derive_task_id("Write the importer", at));
        assert_ne!(
            base,
            derive_task_id("Write the exporter", at + chrono::Duration::seconds(1))
        );
    }

    #[test]
    fn test_validate_task_id() {
        assert!(validate_task_id("a1b2c3d4").is_ok());
        assert!(validate_task_id("00000000").is_ok());
        assert!(validate_task_id("deadbeef").is_ok());

        assert_eq!(
            validate_task_id("A1B2C3D4"),
            Err(TaskError::InvalidId("A1B2C3D4".to_string()))
        );
        assert!(validate_task_id("a1b2c3").is_err());
        assert!(validate_task_id("a1b2c3d4e5").is_err());
        assert!(validate_task_id("a1b2c3g4").is_err());
        assert!(validate_task_id("").is_err());
    }

    #[test]
    fn test_validate_title() {
        assert!(validate_title("Fix it").is_ok());
        assert!(validate_title("").is_err());
        assert!(validate_title("   ").is_err());
    }
}
