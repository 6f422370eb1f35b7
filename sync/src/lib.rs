//! Version-control bridge for the foreman work-queue engine.
//!
//! The durable SQLite store is the single source of truth; this crate
//! derives newline-delimited JSON files from it (`tasks.jsonl`,
//! `dependencies.jsonl`) plus a human-readable `SESSION_STATE.md`, all
//! under a `.tasks/` directory meant to be committed alongside the
//! code the tasks describe.
//!
//! On a fresh clone the database is absent, so
//! [`SyncBridge::bootstrap`] imports the JSONL files into the empty
//! store; on every later start the store wins and the files are never
//! read. Imports are idempotent: lines whose id (tasks) or
//! `(src, dst, type)` tuple (edges) already exists are skipped.

mod bridge;

pub use bridge::{
    BootstrapOutcome, ExportStats, ImportStats, SyncBridge, DEFAULT_TASKS_DIR, DEPENDENCIES_FILE,
    SESSION_STATE_FILE, TASKS_FILE,
};

pub use foreman_core::{
    error::{Result, TaskError},
    store::TaskStore,
};
