//! SQLite persistence for the foreman work-queue engine.
//!
//! This crate provides [`SqliteStore`], the durable implementation of
//! the [`TaskStore`] contract defined in `foreman-core`. The database
//! file is the single source of truth; the JSONL files written by
//! `foreman-sync` are derived from it and never read while it exists.
//!
//! File-backed stores run with WAL journaling and foreign keys
//! enforced. Explicit transactions nest via savepoints, so an inner
//! rollback discards only the inner work.

mod common;
mod sqlite;

pub use sqlite::SqliteStore;

// Re-export the core contract and models so store consumers can use a
// single import path.
pub use foreman_core::{
    error::{Result, TaskError},
    models::{
        Comment, CompleteResult, ContainerSummary, Dependency, DepType, NewTask, Priority,
        SessionState, Task, TaskCounts, TaskFilter, TaskStatus, TaskType, UpdateTask,
    },
    store::TaskStore,
};
