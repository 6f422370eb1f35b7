//! Scheduling and the public API of the foreman work-queue engine.
//!
//! Two pieces live here:
//!
//! - [`Scheduler`] owns the volatile session: identity, the
//!   current-task pointer, the memoized ready set, and cycle detection
//!   over the blocking subgraph.
//! - [`TaskFacade`] is the API surface agents consume. Every mutating
//!   entry point wraps one store transaction and notifies the
//!   scheduler after commit.
//!
//! The engine is single-threaded cooperative: neither type is
//! `Sync`, and callers running agents concurrently serialise access
//! through one command loop.

mod facade;
mod scheduler;

pub use facade::{SessionContext, TaskFacade};
pub use scheduler::Scheduler;

pub use foreman_core::{
    error::{Result, TaskError},
    models::{
        Comment, CompleteResult, ContainerSummary, Dependency, DepType, NewTask, Priority,
        SessionState, Task, TaskCounts, TaskFilter, TaskStatus, TaskType, UpdateTask,
    },
    store::TaskStore,
};
