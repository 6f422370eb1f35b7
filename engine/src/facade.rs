use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use foreman_core::{
    error::{Result, TaskError},
    ident::{derive_task_id, validate_task_id, validate_title},
    models::{
        now_secs, Comment, CompleteResult, ContainerSummary, Dependency, DepType, NewTask,
        Priority, SessionState, Task, TaskCounts, TaskFilter, TaskStatus, TaskType, UpdateTask,
    },
    store::TaskStore,
};
use serde::Serialize;

use crate::scheduler::Scheduler;

/// One-call session snapshot for agent prompts and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub session_id: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    pub current_task: Option<Task>,
    /// Ready queue, capped at the top ten by priority
    pub ready: Vec<Task>,
    /// Open work under every root container, down to the asked depth
    pub open: Vec<Task>,
    pub counts: TaskCounts,
}

/// Number of ready tasks included in a [`SessionContext`].
const SESSION_CONTEXT_READY_LIMIT: usize = 10;

/// The public API surface agents consume.
///
/// Every mutating entry point wraps exactly one store transaction,
/// commits before the scheduler is notified, and rolls back on error
/// so no partial state is observable. A rollback failure is logged at
/// `error` and never masks the error that aborted the mutation.
///
/// Ephemeral tasks never reach the store: they live in a facade-owned
/// map for the lifetime of the process, are observable through
/// [`get_task`](TaskFacade::get_task), and reject every mutation with
/// `CannotUpdateEphemeral`.
pub struct TaskFacade<S: TaskStore> {
    store: S,
    scheduler: Scheduler,
    ephemeral: HashMap<String, Task>,
}

impl<S: TaskStore> TaskFacade<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            scheduler: Scheduler::new(),
            ephemeral: HashMap::new(),
        }
    }

    /// Direct store access, for the sync bridge and tests.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Snapshot of the volatile session, if one exists.
    pub fn session_state(&self) -> Option<SessionState> {
        self.scheduler.session_state()
    }

    // ------------------------------------------------------------------
    // Session and current-task discipline
    // ------------------------------------------------------------------

    /// Begin a fresh session and persist its initial record.
    pub async fn start_session(&mut self) -> Result<String> {
        self.store.begin_transaction().await?;
        let result = self.scheduler.start_session(&mut self.store).await;
        self.finish_tx(result).await
    }

    /// Adopt a session without touching the store (volatile only).
    pub fn restore_session(
        &mut self,
        session_id: String,
        current_task_id: Option<String>,
        started_at: DateTime<Utc>,
    ) {
        self.scheduler
            .restore_session(session_id, current_task_id, started_at);
    }

    /// Restore the session persisted by a previous process, if any.
    pub async fn resume_session(&mut self) -> Result<Option<SessionState>> {
        let Some(state) = self.store.load_session_state().await? else {
            return Ok(None);
        };
        self.scheduler.restore_session(
            state.session_id.clone(),
            state.current_task_id.clone(),
            state.started_at,
        );
        Ok(Some(state))
    }

    /// Point the session at `id`, moving a `pending` task to
    /// `in_progress`.
    pub async fn set_current_task(&mut self, id: &str) -> Result<Task> {
        self.guard_mutation(id)?;
        self.store.begin_transaction().await?;
        let result = self.scheduler.set_current_task(&mut self.store, id).await;
        self.finish_tx(result).await
    }

    /// The session's current task, if it is still workable. Never
    /// auto-assigns; a stale pointer is cleared and `None` returned.
    pub async fn get_current_task(&mut self) -> Result<Option<Task>> {
        self.scheduler.get_current_task(&mut self.store).await
    }

    /// Legacy adoption policy: with no current task and exactly one
    /// `in_progress` task, adopt it. Callers must opt in explicitly.
    pub async fn adopt_orphaned_task(&mut self) -> Result<Option<Task>> {
        self.store.begin_transaction().await?;
        let result = self.scheduler.adopt_orphaned_task(&mut self.store).await;
        self.finish_tx(result).await
    }

    /// Unconditionally drop the current-task pointer.
    pub async fn clear_current_task(&mut self) -> Result<()> {
        self.scheduler.clear_current_task();
        if let Some(state) = self.scheduler.session_state() {
            self.store.begin_transaction().await?;
            let result = self.store.save_session_state(&state).await;
            self.finish_tx(result).await?;
        }
        Ok(())
    }

    /// The ready queue, served through the scheduler's id cache.
    pub async fn get_ready_tasks(&mut self) -> Result<Vec<Task>> {
        self.scheduler.get_ready_tasks(&mut self.store).await
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a task. The id is derived from `(title, created_at)`;
    /// a collision fails the call and the caller may retry.
    ///
    /// When `must_complete_first` is non-empty, a `blocks` edge from
    /// each listed id is added in the same transaction, and the new
    /// task starts `blocked` if any source is not yet terminal.
    pub async fn create_task(&mut self, params: NewTask) -> Result<Task> {
        validate_title(&params.title)?;
        let now = now_secs();
        let id = derive_task_id(&params.title, now);

        if self.ephemeral.contains_key(&id) || self.store.task_exists(&id).await? {
            return Err(TaskError::IdCollision(id));
        }
        if params.task_type.is_container() && !params.must_complete_first.is_empty() {
            return Err(TaskError::CannotBlockContainer(id));
        }

        if params.task_type.is_ephemeral() {
            if !params.must_complete_first.is_empty() {
                return Err(TaskError::Validation(
                    "ephemeral tasks cannot participate in blocking".to_string(),
                ));
            }
            let task = build_task(&id, &params, now);
            self.ephemeral.insert(id.clone(), task.clone());
            tracing::debug!(task_id = %id, "created ephemeral task in memory");
            return Ok(task);
        }

        self.store.begin_transaction().await?;
        let result = self.create_task_tx(&id, &params, now).await;
        let task = self.finish_tx(result).await?;
        self.scheduler.invalidate_cache();
        Ok(task)
    }

    async fn create_task_tx(&mut self, id: &str, params: &NewTask, now: DateTime<Utc>) -> Result<Task> {
        if let Some(parent_id) = &params.parent_id {
            if !self.store.task_exists(parent_id).await? {
                return Err(TaskError::not_found_task(parent_id));
            }
        }

        self.store.save_task(&build_task(id, params, now)).await?;

        let mut blocked = false;
        for src in &params.must_complete_first {
            let src_task = self
                .store
                .load_task(src)
                .await?
                .ok_or_else(|| TaskError::source_not_found(src))?;
            self.store
                .save_dependency(&Dependency::new(src, id, DepType::Blocks))
                .await?;
            if !src_task.status.is_terminal() {
                blocked = true;
            }
        }
        if blocked {
            self.store
                .update_task_status(id, TaskStatus::Blocked, None)
                .await?;
        }

        self.store
            .load_task(id)
            .await?
            .ok_or_else(|| TaskError::Storage(format!("created task {id} vanished")))
    }

    /// Create a child of `parent` and link it with a `parent` edge,
    /// all in one transaction.
    pub async fn add_subtask(&mut self, parent: &str, params: NewTask) -> Result<Task> {
        validate_task_id(parent)?;
        if params.task_type.is_ephemeral() {
            return Err(TaskError::Validation(
                "subtasks cannot be ephemeral".to_string(),
            ));
        }
        let mut params = params;
        params.parent_id = Some(parent.to_string());

        self.store.begin_transaction().await?;
        let result = self.add_subtask_tx(parent, params).await;
        let task = self.finish_tx(result).await?;
        self.scheduler.invalidate_cache();
        Ok(task)
    }

    async fn add_subtask_tx(&mut self, parent: &str, params: NewTask) -> Result<Task> {
        // nested call rides on a savepoint inside our transaction
        let task = self.create_task(params).await?;
        self.store
            .save_dependency(&Dependency::new(parent, &task.id, DepType::Parent))
            .await?;
        Ok(task)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_task(&mut self, id: &str) -> Result<Option<Task>> {
        if let Some(task) = self.ephemeral.get(id) {
            return Ok(Some(task.clone()));
        }
        self.store.load_task(id).await
    }

    pub async fn list_tasks(&mut self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.list_tasks(filter).await
    }

    /// Filter shortcut: every task currently in `blocked` status.
    pub async fn get_blocked_tasks(&mut self) -> Result<Vec<Task>> {
        self.store
            .list_tasks(&TaskFilter::by_status(TaskStatus::Blocked))
            .await
    }

    pub async fn get_children(&mut self, parent_id: &str) -> Result<Vec<Task>> {
        self.store.get_children(parent_id).await
    }

    pub async fn get_siblings(&mut self, id: &str) -> Result<Vec<Task>> {
        self.store.get_siblings(id).await
    }

    pub async fn get_blocked_by(&mut self, id: &str) -> Result<Vec<Task>> {
        self.store.get_blocked_by(id).await
    }

    pub async fn get_blocking(&mut self, id: &str) -> Result<Vec<Task>> {
        self.store.get_blocking(id).await
    }

    pub async fn get_blocked_by_count(&mut self, id: &str) -> Result<i64> {
        self.store.get_blocked_by_count(id).await
    }

    pub async fn get_container_summary(&mut self, id: &str) -> Result<ContainerSummary> {
        self.store.get_container_summary(id).await
    }

    pub async fn get_task_counts(&mut self) -> Result<TaskCounts> {
        self.store.get_task_counts().await
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Set a task's status.
    ///
    /// Transitions into a terminal status run the cascade-unblock wave
    /// (terminal sources stop counting toward `blocked_by_count`); a
    /// transition to `completed` additionally reports the released ids
    /// as a [`CompleteResult`].
    pub async fn update_status(
        &mut self,
        id: &str,
        status: TaskStatus,
    ) -> Result<Option<CompleteResult>> {
        self.guard_mutation(id)?;
        self.store.begin_transaction().await?;
        let result = self.set_status_tx(id, status).await;
        let unblocked = self.finish_tx(result).await?;
        self.scheduler.handle_task_status_change(id, status, None);

        Ok((status == TaskStatus::Completed).then(|| CompleteResult {
            id: id.to_string(),
            unblocked,
        }))
    }

    /// Complete a task and release every destination whose last
    /// non-terminal blocker it was.
    pub async fn complete_task(&mut self, id: &str) -> Result<CompleteResult> {
        self.guard_mutation(id)?;
        self.store.begin_transaction().await?;
        let result = self.set_status_tx(id, TaskStatus::Completed).await;
        let unblocked = self.finish_tx(result).await?;
        self.scheduler
            .handle_task_status_change(id, TaskStatus::Completed, None);

        Ok(CompleteResult {
            id: id.to_string(),
            unblocked,
        })
    }

    async fn set_status_tx(&mut self, id: &str, status: TaskStatus) -> Result<Vec<String>> {
        let task = self
            .store
            .load_task(id)
            .await?
            .ok_or_else(|| TaskError::not_found_task(id))?;

        if status == TaskStatus::Blocked && task.task_type.is_container() {
            return Err(TaskError::CannotBlockContainer(id.to_string()));
        }
        if !task.can_transition_to(status) {
            return Err(TaskError::InvalidTransition(task.status, status));
        }

        let completed_at = (status == TaskStatus::Completed).then(now_secs);
        self.store
            .update_task_status(id, status, completed_at)
            .await?;

        if status.is_terminal() {
            let unblocked = self.store.get_newly_unblocked_tasks(id).await?;
            for dst in &unblocked {
                self.store
                    .update_task_status(dst, TaskStatus::Pending, None)
                    .await?;
            }
            Ok(unblocked)
        } else {
            Ok(Vec::new())
        }
    }

    pub async fn update_title(&mut self, id: &str, title: &str) -> Result<()> {
        self.guard_mutation(id)?;
        validate_title(title)?;
        self.store.begin_transaction().await?;
        let result = self.store.update_task_title(id, title).await;
        self.finish_tx(result).await?;
        self.scheduler.invalidate_cache();
        Ok(())
    }

    pub async fn update_priority(&mut self, id: &str, priority: Priority) -> Result<()> {
        self.guard_mutation(id)?;
        self.store.begin_transaction().await?;
        let result = self.store.update_task_priority(id, priority).await;
        self.finish_tx(result).await?;
        self.scheduler.invalidate_cache();
        Ok(())
    }

    /// Change a task's type. Changing to or from `ephemeral` is
    /// rejected; converting a `blocked` task to `container` relaxes
    /// its status to `pending`, since containers are never blocked.
    pub async fn update_task_type(&mut self, id: &str, task_type: TaskType) -> Result<()> {
        validate_task_id(id)?;
        if self.ephemeral.contains_key(id) {
            return Err(TaskError::CannotChangeEphemeral(id.to_string()));
        }
        self.store.begin_transaction().await?;
        let result = self.update_type_tx(id, task_type).await;
        let status = self.finish_tx(result).await?;
        self.scheduler
            .handle_task_status_change(id, status, Some(task_type));
        Ok(())
    }

    async fn update_type_tx(&mut self, id: &str, task_type: TaskType) -> Result<TaskStatus> {
        let task = self
            .store
            .load_task(id)
            .await?
            .ok_or_else(|| TaskError::not_found_task(id))?;

        if task_type.is_ephemeral() || task.task_type.is_ephemeral() {
            return Err(TaskError::CannotChangeEphemeral(id.to_string()));
        }

        let mut status = task.status;
        if task_type.is_container() && task.status == TaskStatus::Blocked {
            self.store
                .update_task_status(id, TaskStatus::Pending, None)
                .await?;
            status = TaskStatus::Pending;
        }
        self.store.update_task_type(id, task_type).await?;
        Ok(status)
    }

    pub async fn update_commit_tracking(
        &mut self,
        id: &str,
        started_at_commit: Option<&str>,
        completed_at_commit: Option<&str>,
    ) -> Result<()> {
        self.guard_mutation(id)?;
        self.store.begin_transaction().await?;
        let result = self
            .store
            .update_commit_tracking(id, started_at_commit, completed_at_commit)
            .await;
        self.finish_tx(result).await?;
        self.scheduler.invalidate_cache();
        Ok(())
    }

    /// Batch update in a single transaction; all rules of the
    /// individual updaters apply. Returns a [`CompleteResult`] when
    /// the batch completed the task.
    pub async fn update_task(
        &mut self,
        id: &str,
        updates: UpdateTask,
    ) -> Result<Option<CompleteResult>> {
        self.guard_mutation(id)?;
        if let Some(title) = &updates.title {
            validate_title(title)?;
        }

        self.store.begin_transaction().await?;
        let result = self.update_task_tx(id, &updates).await;
        let (status, task_type, unblocked) = self.finish_tx(result).await?;
        self.scheduler.handle_task_status_change(id, status, task_type);

        Ok((updates.status == Some(TaskStatus::Completed)).then(|| CompleteResult {
            id: id.to_string(),
            unblocked,
        }))
    }

    async fn update_task_tx(
        &mut self,
        id: &str,
        updates: &UpdateTask,
    ) -> Result<(TaskStatus, Option<TaskType>, Vec<String>)> {
        let task = self
            .store
            .load_task(id)
            .await?
            .ok_or_else(|| TaskError::not_found_task(id))?;
        let mut status = task.status;

        if let Some(title) = &updates.title {
            self.store.update_task_title(id, title).await?;
        }
        if let Some(priority) = updates.priority {
            self.store.update_task_priority(id, priority).await?;
        }
        if let Some(task_type) = updates.task_type {
            status = self.update_type_tx(id, task_type).await?;
        }

        let mut unblocked = Vec::new();
        if let Some(new_status) = updates.status {
            unblocked = self.set_status_tx(id, new_status).await?;
            status = new_status;
        }
        Ok((status, updates.task_type, unblocked))
    }

    /// Delete a task outright (rare). Edges touching it are removed
    /// atomically, and destinations whose last non-terminal blocker it
    /// was are released back to `pending`.
    pub async fn delete_task(&mut self, id: &str) -> Result<()> {
        validate_task_id(id)?;
        if self.ephemeral.remove(id).is_some() {
            return Ok(());
        }

        self.store.begin_transaction().await?;
        let result = self.delete_task_tx(id).await;
        self.finish_tx(result).await?;

        if self.scheduler.current_task_id() == Some(id) {
            self.scheduler.clear_current_task();
        }
        self.scheduler.invalidate_cache();
        Ok(())
    }

    async fn delete_task_tx(&mut self, id: &str) -> Result<()> {
        let unblocked = self.store.get_newly_unblocked_tasks(id).await?;
        self.store.delete_task(id).await?;
        for dst in &unblocked {
            self.store
                .update_task_status(dst, TaskStatus::Pending, None)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    /// Add a dependency edge. `blocks` edges run cycle detection and
    /// move a `pending` destination to `blocked` when the source is
    /// not yet terminal.
    pub async fn add_dependency(&mut self, src: &str, dst: &str, dep_type: DepType) -> Result<()> {
        self.guard_mutation(src)?;
        self.guard_mutation(dst)?;
        if src == dst {
            return Err(TaskError::SelfDependency(src.to_string()));
        }

        self.store.begin_transaction().await?;
        let result = self.add_dependency_tx(src, dst, dep_type).await;
        let dst_status = self.finish_tx(result).await?;

        match dst_status {
            Some(status) => self.scheduler.handle_task_status_change(dst, status, None),
            None => self.scheduler.invalidate_cache(),
        }
        Ok(())
    }

    async fn add_dependency_tx(
        &mut self,
        src: &str,
        dst: &str,
        dep_type: DepType,
    ) -> Result<Option<TaskStatus>> {
        let src_task = self
            .store
            .load_task(src)
            .await?
            .ok_or_else(|| TaskError::source_not_found(src))?;
        let dst_task = self
            .store
            .load_task(dst)
            .await?
            .ok_or_else(|| TaskError::destination_not_found(dst))?;

        if dep_type == DepType::Blocks {
            if dst_task.task_type.is_container() {
                return Err(TaskError::CannotBlockContainer(dst.to_string()));
            }
            if self
                .scheduler
                .would_create_cycle(&mut self.store, src, dst)
                .await?
            {
                return Err(TaskError::CircularDependency(
                    src.to_string(),
                    dst.to_string(),
                ));
            }
        }

        self.store
            .save_dependency(&Dependency::new(src, dst, dep_type))
            .await?;

        if dep_type == DepType::Blocks
            && !src_task.status.is_terminal()
            && dst_task.status == TaskStatus::Pending
        {
            self.store
                .update_task_status(dst, TaskStatus::Blocked, None)
                .await?;
            return Ok(Some(TaskStatus::Blocked));
        }
        Ok(None)
    }

    /// Remove a dependency edge. Removing the last non-terminal
    /// `blocks` edge into a `blocked` destination releases it.
    pub async fn remove_dependency(
        &mut self,
        src: &str,
        dst: &str,
        dep_type: DepType,
    ) -> Result<()> {
        self.guard_mutation(src)?;
        self.guard_mutation(dst)?;

        self.store.begin_transaction().await?;
        let result = self.remove_dependency_tx(src, dst, dep_type).await;
        let dst_status = self.finish_tx(result).await?;

        match dst_status {
            Some(status) => self.scheduler.handle_task_status_change(dst, status, None),
            None => self.scheduler.invalidate_cache(),
        }
        Ok(())
    }

    async fn remove_dependency_tx(
        &mut self,
        src: &str,
        dst: &str,
        dep_type: DepType,
    ) -> Result<Option<TaskStatus>> {
        self.store.delete_dependency(src, dst, dep_type).await?;

        if dep_type != DepType::Blocks {
            return Ok(None);
        }
        let dst_task = self
            .store
            .load_task(dst)
            .await?
            .ok_or_else(|| TaskError::destination_not_found(dst))?;
        if dst_task.status == TaskStatus::Blocked
            && self.store.get_blocked_by_count(dst).await? == 0
        {
            self.store
                .update_task_status(dst, TaskStatus::Pending, None)
                .await?;
            return Ok(Some(TaskStatus::Pending));
        }
        Ok(None)
    }

    /// Walk the dependency graph breadth-first from `start`, treating
    /// every edge as traversable from either endpoint, optionally
    /// restricted to one edge type. Returns tasks in visit order,
    /// starting with `start` itself.
    pub async fn traverse_dependencies(
        &mut self,
        start: &str,
        max_depth: u32,
        edge_type: Option<DepType>,
    ) -> Result<Vec<Task>> {
        if !self.store.task_exists(start).await? {
            return Err(TaskError::not_found_task(start));
        }

        let edges = self.store.load_all_dependencies().await?;
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &edges {
            if edge_type.is_some() && edge_type != Some(edge.dep_type) {
                continue;
            }
            adjacency
                .entry(edge.src_id.as_str())
                .or_default()
                .push(edge.dst_id.as_str());
            adjacency
                .entry(edge.dst_id.as_str())
                .or_default()
                .push(edge.src_id.as_str());
        }

        let mut order: Vec<String> = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&str, u32)> = VecDeque::new();
        visited.insert(start);
        queue.push_back((start, 0));
        while let Some((node, depth)) = queue.pop_front() {
            order.push(node.to_string());
            if depth == max_depth {
                continue;
            }
            if let Some(neighbors) = adjacency.get(node) {
                for &neighbor in neighbors {
                    if visited.insert(neighbor) {
                        queue.push_back((neighbor, depth + 1));
                    }
                }
            }
        }

        self.store.load_tasks_by_ids(&order).await
    }

    /// Dashboard view: walk down from every root container (a
    /// container with no parent) to `max_depth`, collecting open work.
    /// A visited task is included when its status is `pending` or
    /// `in_progress` and it is either a leaf-level task or a container
    /// sitting exactly at the depth cutoff.
    pub async fn get_open_at_depth(&mut self, max_depth: u32) -> Result<Vec<Task>> {
        let containers = self
            .store
            .list_tasks(&TaskFilter {
                task_type: Some(TaskType::Container),
                ..Default::default()
            })
            .await?;

        let mut result = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(Task, u32)> = containers
            .into_iter()
            .filter(|t| t.parent_id.is_none())
            .map(|t| (t, 0))
            .collect();

        while let Some((task, depth)) = queue.pop_front() {
            if !visited.insert(task.id.clone()) {
                continue;
            }
            let open = matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress);
            if open && (!task.task_type.is_container() || depth == max_depth) {
                result.push(task.clone());
            }
            if depth < max_depth {
                for child in self.store.get_children(&task.id).await? {
                    queue.push_back((child, depth + 1));
                }
            }
        }
        Ok(result)
    }

    /// Everything an agent needs to orient at the top of a turn.
    pub async fn get_session_context(&mut self, depth: u32) -> Result<SessionContext> {
        let current_task = self.get_current_task().await?;
        let mut ready = self.get_ready_tasks().await?;
        ready.truncate(SESSION_CONTEXT_READY_LIMIT);
        let open = self.get_open_at_depth(depth).await?;
        let counts = self.store.get_task_counts().await?;

        Ok(SessionContext {
            session_id: self.scheduler.session_id().map(str::to_string),
            started_at: self.scheduler.session_started_at(),
            current_task,
            ready,
            open,
            counts,
        })
    }

    // ------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------

    /// Append to a task's audit trail. The timestamp is assigned here;
    /// append order is preserved even within one second.
    pub async fn add_comment(&mut self, task_id: &str, agent: &str, content: &str) -> Result<Comment> {
        self.guard_mutation(task_id)?;
        if agent.trim().is_empty() {
            return Err(TaskError::empty_field("agent"));
        }
        if content.trim().is_empty() {
            return Err(TaskError::empty_field("content"));
        }

        let comment = Comment::new(agent, content, now_secs());
        self.store.begin_transaction().await?;
        let result = self.store.append_comment(task_id, &comment).await;
        self.finish_tx(result).await?;
        self.scheduler.invalidate_cache();
        Ok(comment)
    }

    pub async fn list_task_comments(&mut self, task_id: &str) -> Result<Vec<Comment>> {
        if self.ephemeral.contains_key(task_id) {
            return Ok(Vec::new());
        }
        self.store.get_comments(task_id).await
    }

    pub async fn get_last_comment_from(
        &mut self,
        task_id: &str,
        agent: &str,
    ) -> Result<Option<Comment>> {
        if self.ephemeral.contains_key(task_id) {
            return Ok(None);
        }
        self.store.get_last_comment_from(task_id, agent).await
    }

    /// Tasks carrying at least one comment with the given prefix.
    pub async fn get_tasks_with_comment_prefix(&mut self, prefix: &str) -> Result<Vec<Task>> {
        let ids = self.store.get_tasks_with_comment_prefix(prefix).await?;
        self.store.load_tasks_by_ids(&ids).await
    }

    pub async fn count_comments_with_prefix(
        &mut self,
        task_id: &str,
        agent: &str,
        prefix: &str,
    ) -> Result<i64> {
        self.store
            .count_comments_with_prefix(task_id, agent, prefix)
            .await
    }

    // ------------------------------------------------------------------
    // Agent workflow shortcuts
    // ------------------------------------------------------------------

    /// Block a task with an explanatory comment, in one transaction.
    pub async fn block_task(&mut self, id: &str, agent: &str, reason: &str) -> Result<()> {
        self.guard_mutation(id)?;
        self.store.begin_transaction().await?;
        let result = self.block_task_tx(id, agent, reason).await;
        self.finish_tx(result).await?;
        self.scheduler
            .handle_task_status_change(id, TaskStatus::Blocked, None);
        Ok(())
    }

    async fn block_task_tx(&mut self, id: &str, agent: &str, reason: &str) -> Result<()> {
        self.set_status_tx(id, TaskStatus::Blocked).await?;
        self.store
            .append_comment(id, &Comment::new(agent, reason, now_secs()))
            .await?;
        Ok(())
    }

    /// Reviewer verdict: append a `REJECTED: ...` comment.
    pub async fn request_revision(
        &mut self,
        id: &str,
        agent: &str,
        reason: &str,
    ) -> Result<Comment> {
        self.add_comment(id, agent, &format!("REJECTED: {reason}"))
            .await
    }

    /// Executor hand-off: append a `SUMMARY: ...` comment and record
    /// the commit that completed the work, in one transaction.
    pub async fn submit_work(
        &mut self,
        id: &str,
        agent: &str,
        summary: &str,
        completed_at_commit: Option<&str>,
    ) -> Result<Comment> {
        self.guard_mutation(id)?;
        if agent.trim().is_empty() {
            return Err(TaskError::empty_field("agent"));
        }

        let comment = Comment::new(agent, format!("SUMMARY: {summary}"), now_secs());
        self.store.begin_transaction().await?;
        let result = self
            .submit_work_tx(id, &comment, completed_at_commit)
            .await;
        self.finish_tx(result).await?;
        self.scheduler.invalidate_cache();
        Ok(comment)
    }

    async fn submit_work_tx(
        &mut self,
        id: &str,
        comment: &Comment,
        completed_at_commit: Option<&str>,
    ) -> Result<()> {
        self.store.append_comment(id, comment).await?;
        if completed_at_commit.is_some() {
            self.store
                .update_commit_tracking(id, None, completed_at_commit)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Mutation preflight: the id must be well formed and must not
    /// name an ephemeral task.
    fn guard_mutation(&self, id: &str) -> Result<()> {
        validate_task_id(id)?;
        if self.ephemeral.contains_key(id) {
            return Err(TaskError::CannotUpdateEphemeral(id.to_string()));
        }
        Ok(())
    }

    /// Commit on success; on failure roll back and surface the
    /// original error. A rollback failure is logged, never returned in
    /// place of the error that aborted the mutation.
    async fn finish_tx<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.store.commit_transaction().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback_transaction().await {
                    tracing::error!(
                        error = %rollback_err,
                        "failed to roll back aborted transaction; state may be inconsistent"
                    );
                }
                Err(err)
            }
        }
    }
}

fn build_task(id: &str, params: &NewTask, now: DateTime<Utc>) -> Task {
    let mut task = Task::new(id, &params.title, now);
    task.description = params.description.clone();
    task.priority = params.priority;
    task.task_type = params.task_type;
    task.labels = params.labels.clone();
    task.parent_id = params.parent_id.clone();
    task
}
