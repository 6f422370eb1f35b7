use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use foreman_core::{
    error::{Result, TaskError},
    ident::validate_task_id,
    models::{Dependency, SessionState, Task, TaskFilter, TaskStatus},
    store::TaskStore,
};

/// Version-controlled task export, one task per line in id order.
pub const TASKS_FILE: &str = "tasks.jsonl";
/// Version-controlled edge export, one edge per line in
/// `(src, dst, type)` order.
pub const DEPENDENCIES_FILE: &str = "dependencies.jsonl";
/// Human-readable session summary.
pub const SESSION_STATE_FILE: &str = "SESSION_STATE.md";
/// Conventional directory at the repository root.
pub const DEFAULT_TASKS_DIR: &str = ".tasks";

/// Ready tasks listed in `SESSION_STATE.md`.
const SESSION_STATE_READY_LIMIT: usize = 10;
/// Completed tasks listed in `SESSION_STATE.md`.
const SESSION_STATE_COMPLETED_LIMIT: usize = 3;

/// Rows written by an export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub tasks: usize,
    pub dependencies: usize,
}

/// New rows inserted by an import; re-importing the same files is
/// idempotent and reports zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub tasks: usize,
    pub dependencies: usize,
}

/// Which branch of the cold-start protocol ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The durable store already held data; JSONL was left unread.
    LoadedExisting { tasks: usize },
    /// A fresh store was populated from the JSONL files.
    Imported(ImportStats),
    /// Neither store data nor JSONL files: empty start.
    Empty,
}

/// Bridge between the durable store and the newline-delimited JSON
/// files tracked in version control.
///
/// The store is the source of truth; the JSONL files are derived from
/// it and are only ever read into an *empty* store (a fresh clone).
/// Writes are atomic (write-to-temp-then-rename) so an interrupted
/// export never leaves a half-written file behind.
#[derive(Debug, Clone)]
pub struct SyncBridge {
    dir: PathBuf,
}

impl SyncBridge {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialise every task and edge to the JSONL files.
    pub async fn export<S: TaskStore>(&self, store: &mut S) -> Result<ExportStats> {
        fs::create_dir_all(&self.dir).map_err(|e| io_error("create tasks dir", &e))?;

        let mut tasks = store.load_all_tasks().await?;
        // the store never holds ephemerals; filter anyway so no code
        // path can leak them into version control
        tasks.retain(|t| !t.task_type.is_ephemeral());
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut lines = String::new();
        for task in &tasks {
            lines.push_str(&to_json_line(task)?);
            lines.push('\n');
        }
        write_atomic(&self.dir.join(TASKS_FILE), &lines)?;

        let mut dependencies = store.load_all_dependencies().await?;
        dependencies.sort_by(|a, b| {
            (a.src_id.as_str(), a.dst_id.as_str(), a.dep_type.as_str()).cmp(&(
                b.src_id.as_str(),
                b.dst_id.as_str(),
                b.dep_type.as_str(),
            ))
        });

        let mut lines = String::new();
        for dep in &dependencies {
            lines.push_str(&to_json_line(dep)?);
            lines.push('\n');
        }
        write_atomic(&self.dir.join(DEPENDENCIES_FILE), &lines)?;

        let stats = ExportStats {
            tasks: tasks.len(),
            dependencies: dependencies.len(),
        };
        tracing::info!(
            tasks = stats.tasks,
            dependencies = stats.dependencies,
            dir = %self.dir.display(),
            "exported task store"
        );
        Ok(stats)
    }

    /// Read the JSONL files into the store, inserting only rows that
    /// are not already present. Malformed lines are logged and
    /// skipped; the whole import runs in one transaction.
    pub async fn import<S: TaskStore>(&self, store: &mut S) -> Result<ImportStats> {
        store.begin_transaction().await?;
        let result = self.import_rows(store).await;
        match result {
            Ok(stats) => {
                store.commit_transaction().await?;
                tracing::info!(
                    tasks = stats.tasks,
                    dependencies = stats.dependencies,
                    "imported task store"
                );
                Ok(stats)
            }
            Err(err) => {
                if let Err(rollback_err) = store.rollback_transaction().await {
                    tracing::error!(error = %rollback_err, "failed to roll back aborted import");
                }
                Err(err)
            }
        }
    }

    async fn import_rows<S: TaskStore>(&self, store: &mut S) -> Result<ImportStats> {
        let mut stats = ImportStats::default();

        let tasks_path = self.dir.join(TASKS_FILE);
        if tasks_path.exists() {
            let contents =
                fs::read_to_string(&tasks_path).map_err(|e| io_error("read tasks.jsonl", &e))?;
            for (line_no, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let task: Task = match serde_json::from_str(line) {
                    Ok(task) => task,
                    Err(err) => {
                        tracing::warn!(line = line_no + 1, error = %err, "skipping malformed task line");
                        continue;
                    }
                };
                if let Err(err) = validate_task_id(&task.id) {
                    tracing::warn!(line = line_no + 1, error = %err, "skipping task with bad id");
                    continue;
                }
                if task.task_type.is_ephemeral() {
                    tracing::warn!(line = line_no + 1, task_id = %task.id, "skipping ephemeral task line");
                    continue;
                }
                // first-loaded wins; an existing id is left untouched
                if store.task_exists(&task.id).await? {
                    continue;
                }
                store.save_task(&task).await?;
                for comment in &task.comments {
                    store.append_comment(&task.id, comment).await?;
                }
                stats.tasks += 1;
            }
        }

        let deps_path = self.dir.join(DEPENDENCIES_FILE);
        if deps_path.exists() {
            let contents = fs::read_to_string(&deps_path)
                .map_err(|e| io_error("read dependencies.jsonl", &e))?;
            for (line_no, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let dep: Dependency = match serde_json::from_str(line) {
                    Ok(dep) => dep,
                    Err(err) => {
                        tracing::warn!(line = line_no + 1, error = %err, "skipping malformed dependency line");
                        continue;
                    }
                };
                match store.save_dependency(&dep).await {
                    Ok(()) => stats.dependencies += 1,
                    Err(TaskError::DuplicateEdge(_, _, _)) => {}
                    Err(TaskError::ReferentialIntegrity(reason)) => {
                        tracing::warn!(line = line_no + 1, %reason, "skipping dangling dependency line");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(stats)
    }

    /// Write the human-readable `SESSION_STATE.md` summary: session
    /// identity, current task, the ready-queue top ten, and the last
    /// three completions.
    pub async fn write_session_state<S: TaskStore>(
        &self,
        store: &mut S,
        session: Option<&SessionState>,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| io_error("create tasks dir", &e))?;

        let current = match session.and_then(|s| s.current_task_id.as_deref()) {
            Some(id) => store.load_task(id).await?,
            None => None,
        };
        let mut ready = store.get_ready_tasks().await?;
        ready.truncate(SESSION_STATE_READY_LIMIT);
        let mut completed = store
            .list_tasks(&TaskFilter::by_status(TaskStatus::Completed))
            .await?;
        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        completed.truncate(SESSION_STATE_COMPLETED_LIMIT);

        let markdown = render_session_markdown(session, current.as_ref(), &ready, &completed);
        write_atomic(&self.dir.join(SESSION_STATE_FILE), &markdown)
    }

    /// Cold-start protocol: prefer the durable store when it holds
    /// data, otherwise import the JSONL files if present, otherwise
    /// start empty.
    pub async fn bootstrap<S: TaskStore>(&self, store: &mut S) -> Result<BootstrapOutcome> {
        let existing = store.load_all_tasks().await?;
        if !existing.is_empty() {
            return Ok(BootstrapOutcome::LoadedExisting {
                tasks: existing.len(),
            });
        }
        if self.dir.join(TASKS_FILE).exists() {
            let stats = self.import(store).await?;
            return Ok(BootstrapOutcome::Imported(stats));
        }
        Ok(BootstrapOutcome::Empty)
    }
}

impl Default for SyncBridge {
    fn default() -> Self {
        Self::new(DEFAULT_TASKS_DIR)
    }
}

fn render_session_markdown(
    session: Option<&SessionState>,
    current: Option<&Task>,
    ready: &[Task],
    completed: &[Task],
) -> String {
    let mut md = String::from("# Session State\n\n");

    md.push_str("## Session\n\n");
    match session {
        Some(state) => {
            md.push_str(&format!("- id: `{}`\n", state.session_id));
            md.push_str(&format!(
                "- started: {}\n",
                state.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        None => md.push_str("- no active session\n"),
    }

    md.push_str("\n## Current Task\n\n");
    match current {
        Some(task) => md.push_str(&format!("- `{}` {}\n", task.id, task.title)),
        None => md.push_str("- none\n"),
    }

    md.push_str("\n## Ready Queue\n\n");
    if ready.is_empty() {
        md.push_str("- (empty)\n");
    } else {
        for (i, task) in ready.iter().enumerate() {
            md.push_str(&format!(
                "{}. `{}` [{}] {}\n",
                i + 1,
                task.id,
                task.priority,
                task.title
            ));
        }
    }

    md.push_str("\n## Recently Completed\n\n");
    if completed.is_empty() {
        md.push_str("- (none)\n");
    } else {
        for task in completed {
            let when = task
                .completed_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            md.push_str(&format!("- `{}` {} ({when})\n", task.id, task.title));
        }
    }

    md
}

fn to_json_line<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| TaskError::Storage(format!("serialisation failed: {e}")))
}

fn io_error(context: &str, err: &std::io::Error) -> TaskError {
    TaskError::Storage(format!("{context}: {err}"))
}

/// Write via a sibling temp file and rename into place, so a crash
/// mid-write never corrupts the tracked file.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let mut tmp_name: OsString = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    fs::write(&tmp, contents).map_err(|e| io_error("write temp file", &e))?;
    fs::rename(&tmp, path).map_err(|e| io_error("rename temp file", &e))?;
    Ok(())
}
