use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use foreman_core::{
    error::{Result, TaskError},
    models::{now_secs, DepType, SessionState, Task, TaskFilter, TaskStatus, TaskType},
    store::TaskStore,
};

/// Owner of the volatile session: identity, the current-task pointer,
/// the memoized ready set, and cycle detection over the blocking
/// subgraph.
///
/// The scheduler holds per-process state only; everything durable goes
/// through the store it is handed per call. The ready cache stores
/// task ids, never rows, so materialisation always observes the latest
/// attribute values, and every mutation path invalidates it before
/// returning to the caller.
#[derive(Debug, Default)]
pub struct Scheduler {
    session_id: Option<String>,
    session_started_at: Option<DateTime<Utc>>,
    current_task_id: Option<String>,
    ready_cache: Vec<String>,
    ready_cache_valid: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn session_started_at(&self) -> Option<DateTime<Utc>> {
        self.session_started_at
    }

    pub fn current_task_id(&self) -> Option<&str> {
        self.current_task_id.as_deref()
    }

    /// Snapshot of the volatile session for persistence, if a session
    /// has been started or restored.
    pub fn session_state(&self) -> Option<SessionState> {
        let session_id = self.session_id.clone()?;
        Some(SessionState {
            session_id,
            started_at: self.session_started_at.unwrap_or_else(now_secs),
            current_task_id: self.current_task_id.clone(),
            notes: None,
        })
    }

    /// Begin a fresh session: generate `<epoch>-<4 hex>` identity,
    /// persist the initial session record, drop any cached state.
    pub async fn start_session<S: TaskStore>(&mut self, store: &mut S) -> Result<String> {
        let started_at = now_secs();
        let session_id = generate_session_id(started_at);

        self.session_id = Some(session_id.clone());
        self.session_started_at = Some(started_at);
        self.current_task_id = None;
        self.invalidate_cache();

        store
            .save_session_state(&SessionState {
                session_id: session_id.clone(),
                started_at,
                current_task_id: None,
                notes: None,
            })
            .await?;

        tracing::info!(%session_id, "started session");
        Ok(session_id)
    }

    /// Adopt a previously persisted session. Volatile state only; the
    /// stored record is left untouched.
    pub fn restore_session(
        &mut self,
        session_id: String,
        current_task_id: Option<String>,
        started_at: DateTime<Utc>,
    ) {
        self.session_id = Some(session_id);
        self.session_started_at = Some(started_at);
        self.current_task_id = current_task_id;
        self.invalidate_cache();
    }

    /// Point the session at `id`, moving a `pending` task to
    /// `in_progress` and persisting the session record.
    ///
    /// # Returns
    /// * `Err(TaskError::NotFound)` - the task does not exist
    /// * `Err(TaskError::Validation)` - the task is not workable
    ///   (container, blocked, or terminal)
    pub async fn set_current_task<S: TaskStore>(
        &mut self,
        store: &mut S,
        id: &str,
    ) -> Result<Task> {
        let task = store
            .load_task(id)
            .await?
            .ok_or_else(|| TaskError::not_found_task(id))?;

        if task.task_type.is_container() {
            return Err(TaskError::Validation(format!(
                "container task {id} cannot be the current task"
            )));
        }
        if !task.is_workable() {
            return Err(TaskError::Validation(format!(
                "task {id} is {} and cannot be the current task",
                task.status
            )));
        }

        if task.status == TaskStatus::Pending {
            store
                .update_task_status(id, TaskStatus::InProgress, None)
                .await?;
        }

        self.current_task_id = Some(id.to_string());
        self.ensure_session();
        self.persist_session(store).await?;
        self.invalidate_cache();

        // hand back the row as the caller will observe it
        store
            .load_task(id)
            .await?
            .ok_or_else(|| TaskError::not_found_task(id))
    }

    /// The task the session is working on, if it is still workable.
    ///
    /// A pointer at a task that has since completed, been cancelled,
    /// become blocked, or turned into a container is cleared and
    /// `None` is returned. No task is ever auto-assigned here; callers
    /// pick from the ready queue and call
    /// [`set_current_task`](Scheduler::set_current_task) explicitly.
    pub async fn get_current_task<S: TaskStore>(&mut self, store: &mut S) -> Result<Option<Task>> {
        let Some(id) = self.current_task_id.clone() else {
            return Ok(None);
        };

        match store.load_task(&id).await? {
            Some(task) if task.is_workable() => Ok(Some(task)),
            _ => {
                self.current_task_id = None;
                self.persist_session(store).await?;
                Ok(None)
            }
        }
    }

    /// Compatibility policy for older callers: when no current task is
    /// set and exactly one task is `in_progress`, adopt it.
    pub async fn adopt_orphaned_task<S: TaskStore>(
        &mut self,
        store: &mut S,
    ) -> Result<Option<Task>> {
        if self.current_task_id.is_some() {
            return self.get_current_task(store).await;
        }

        let mut in_progress = store
            .list_tasks(&TaskFilter::by_status(TaskStatus::InProgress))
            .await?;
        if in_progress.len() != 1 {
            return Ok(None);
        }

        let task = in_progress.remove(0);
        tracing::debug!(task_id = %task.id, "adopting orphaned in-progress task");
        self.current_task_id = Some(task.id.clone());
        self.ensure_session();
        self.persist_session(store).await?;
        Ok(Some(task))
    }

    /// Facade hook, invoked after every committed status or type
    /// mutation: drop the current-task pointer when its task stopped
    /// being workable, and invalidate the ready cache.
    pub fn handle_task_status_change(
        &mut self,
        id: &str,
        new_status: TaskStatus,
        new_type: Option<TaskType>,
    ) {
        if self.current_task_id.as_deref() == Some(id) {
            let still_workable = matches!(
                new_status,
                TaskStatus::Pending | TaskStatus::InProgress
            ) && new_type != Some(TaskType::Container);
            if !still_workable {
                tracing::debug!(task_id = id, status = %new_status, "clearing current task");
                self.current_task_id = None;
            }
        }
        self.invalidate_cache();
    }

    /// Unconditionally drop the current-task pointer.
    pub fn clear_current_task(&mut self) {
        self.current_task_id = None;
    }

    /// Drop the ready-set memoization.
    pub fn invalidate_cache(&mut self) {
        self.ready_cache_valid = false;
        self.ready_cache.clear();
    }

    /// The ready queue, served from the id cache when valid.
    ///
    /// Rows are always re-materialised from the store so attribute
    /// edits that do not change membership are still observed.
    pub async fn get_ready_tasks<S: TaskStore>(&mut self, store: &mut S) -> Result<Vec<Task>> {
        if self.ready_cache_valid {
            return store.load_tasks_by_ids(&self.ready_cache).await;
        }

        let tasks = store.get_ready_tasks().await?;
        self.ready_cache = tasks.iter().map(|t| t.id.clone()).collect();
        self.ready_cache_valid = true;
        Ok(tasks)
    }

    /// Would adding the `blocks` edge `src → dst` close a cycle?
    ///
    /// Forward DFS from `dst` over outgoing `blocks` edges; if `src`
    /// is reachable, the new edge would complete a loop. The visited
    /// set bounds the walk at O(V + E) on the blocking subgraph.
    pub async fn would_create_cycle<S: TaskStore>(
        &mut self,
        store: &mut S,
        src: &str,
        dst: &str,
    ) -> Result<bool> {
        if src == dst {
            return Ok(true);
        }

        let edges = store.load_all_dependencies().await?;
        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &edges {
            if edge.dep_type == DepType::Blocks {
                outgoing
                    .entry(edge.src_id.as_str())
                    .or_default()
                    .push(edge.dst_id.as_str());
            }
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack = vec![dst];
        while let Some(node) = stack.pop() {
            if node == src {
                return Ok(true);
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(next) = outgoing.get(node) {
                stack.extend(next.iter().copied());
            }
        }
        Ok(false)
    }

    /// Persist the current volatile session, if one exists.
    async fn persist_session<S: TaskStore>(&mut self, store: &mut S) -> Result<()> {
        if let Some(state) = self.session_state() {
            store.save_session_state(&state).await?;
        }
        Ok(())
    }

    /// Sessions are created lazily the first time a current task is
    /// set without an explicit `start_session`.
    fn ensure_session(&mut self) {
        if self.session_id.is_none() {
            let started_at = now_secs();
            self.session_id = Some(generate_session_id(started_at));
            self.session_started_at = Some(started_at);
        }
    }
}

fn generate_session_id(started_at: DateTime<Utc>) -> String {
    format!("{}-{:04x}", started_at.timestamp(), rand::random::<u16>())
}
