use crate::models::{DepType, TaskStatus};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, TaskError>;

/// Error kinds surfaced by the work-queue engine.
///
/// Every public operation either succeeds or returns exactly one of
/// these kinds; a failed mutation rolls its transaction back so no
/// partial state is observable. Tool layers exposing the engine to
/// agents are expected to serialise the kind, not re-interpret it.
///
/// # Examples
///
/// ```rust
/// use foreman_core::error::TaskError;
///
/// let err = TaskError::not_found_task("a1b2c3d4");
/// assert!(err.is_not_found());
///
/// let err = TaskError::SelfDependency("a1b2c3d4".to_string());
/// assert!(!err.is_not_found());
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// Referenced task id does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A freshly derived id already exists; the caller may retry
    #[error("task id collision: {0}")]
    IdCollision(String),

    /// Attempt to add an edge from a task to itself
    #[error("task {0} cannot depend on itself")]
    SelfDependency(String),

    /// `(src, dst, type)` edge already present
    #[error("dependency {0} -> {1} ({2}) already exists")]
    DuplicateEdge(String, String, DepType),

    /// Adding the `blocks` edge would close a forward cycle
    #[error("dependency {0} -> {1} would create a cycle")]
    CircularDependency(String, String),

    /// Containers are never blocked
    #[error("container task {0} cannot be blocked")]
    CannotBlockContainer(String),

    /// Task type may not change to or from `ephemeral`
    #[error("task {0} cannot change type to or from ephemeral")]
    CannotChangeEphemeral(String),

    /// Ephemeral tasks accept no mutations
    #[error("ephemeral task {0} cannot be updated")]
    CannotUpdateEphemeral(String),

    /// String is not an 8-character lowercase hex task id
    #[error("invalid task id: '{0}'")]
    InvalidId(String),

    /// An edge references a task that is not in the store
    #[error("referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    /// Status change rejected by the lifecycle state machine
    #[error("invalid status transition from {0} to {1}")]
    InvalidTransition(TaskStatus, TaskStatus),

    /// Input rejected before reaching the store
    #[error("validation error: {0}")]
    Validation(String),

    /// Underlying store failure (I/O, disk full, corrupt file)
    #[error("storage error: {0}")]
    Storage(String),

    /// Critical: rollback after a failed mutation itself failed;
    /// state may be inconsistent. Surfaced in logs, never allowed to
    /// mask the original error.
    #[error("transaction rollback failure: {0}")]
    RollbackFailure(String),
}

impl TaskError {
    /// Not-found error for a task id
    pub fn not_found_task(id: &str) -> Self {
        Self::NotFound(format!("task {id}"))
    }

    /// Not-found error for the source of a dependency edge
    pub fn source_not_found(id: &str) -> Self {
        Self::NotFound(format!("dependency source task {id}"))
    }

    /// Not-found error for the destination of a dependency edge
    pub fn destination_not_found(id: &str) -> Self {
        Self::NotFound(format!("dependency destination task {id}"))
    }

    /// Not-found error for a dependency edge
    pub fn dependency_not_found(src: &str, dst: &str, dep_type: DepType) -> Self {
        Self::NotFound(format!("dependency {src} -> {dst} ({dep_type})"))
    }

    /// Validation error for a required field left empty
    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("field '{field}' cannot be empty"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TaskError::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, TaskError::Validation(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, TaskError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let error = TaskError::not_found_task("a1b2c3d4");
        assert_eq!(error, TaskError::NotFound("task a1b2c3d4".to_string()));
        assert!(error.is_not_found());

        let error = TaskError::empty_field("title");
        assert!(error.is_validation());

        let error = TaskError::Storage("disk full".to_string());
        assert!(error.is_storage());
        assert!(!error.is_not_found());
    }

    #[test]
    fn test_error_display() {
        let error = TaskError::DuplicateEdge(
            "a1b2c3d4".to_string(),
            "deadbeef".to_string(),
            DepType::Blocks,
        );
        assert_eq!(
            format!("{error}"),
            "dependency a1b2c3d4 -> deadbeef (blocks) already exists"
        );

        let error = TaskError::InvalidTransition(TaskStatus::Completed, TaskStatus::Pending);
        assert_eq!(
            format!("{error}"),
            "invalid status transition from completed to pending"
        );

        let error = TaskError::CannotBlockContainer("a1b2c3d4".to_string());
        assert_eq!(format!("{error}"), "container task a1b2c3d4 cannot be blocked");
    }
}
