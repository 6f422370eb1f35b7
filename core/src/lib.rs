//! Foreman core library
//!
//! Foundational domain models, error kinds, id derivation, and the
//! persistent-store contract for the agent work-queue engine. All
//! other crates in the workspace depend on the types and interfaces
//! defined here.
//!
//! # Architecture
//!
//! - [`models`] - Core domain models (Task, TaskStatus, Dependency, ...)
//! - [`error`] - Error kinds and result handling
//! - [`ident`] - Deterministic task-id derivation and validation
//! - [`store`] - [`TaskStore`], the persistent-store trait
//!
//! # Example
//!
//! ```rust
//! use foreman_core::{
//!     ident::derive_task_id,
//!     models::{now_secs, NewTask, Priority},
//! };
//!
//! let params = NewTask::titled("Design the importer").priority(Priority::High);
//! let id = derive_task_id(&params.title, now_secs());
//! assert_eq!(id.len(), 8);
//! ```

pub mod error;
pub mod ident;
pub mod models;
pub mod store;

// Re-export commonly used types at the crate root for convenience
pub use error::{Result, TaskError};
pub use models::{
    Comment, CompleteResult, ContainerSummary, Dependency, DepType, NewTask, Priority,
    SessionState, Task, TaskCounts, TaskFilter, TaskStatus, TaskType, UpdateTask,
};
pub use store::TaskStore;

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
