use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{
        Comment, ContainerSummary, Dependency, DepType, Priority, SessionState, Task, TaskCounts,
        TaskFilter, TaskStatus, TaskType,
    },
};

/// Contract of the persistent task store: the single durable source of
/// truth for tasks, dependency edges, comments, and session state.
///
/// Implementations are accessed single-threaded: every method takes
/// `&mut self` and callers running agents concurrently must serialise
/// access externally, e.g. behind one task-manager loop. Each method
/// runs in either an implicit single-statement transaction or the
/// explicit transaction opened by [`begin_transaction`].
///
/// Mutating helpers fail fast with a precise error kind; the outermost
/// transaction owner is responsible for rolling back, and a rollback
/// failure must be logged without masking the original error.
///
/// [`begin_transaction`]: TaskStore::begin_transaction
#[async_trait]
pub trait TaskStore: Send {
    /// Check whether a task row exists.
    async fn task_exists(&mut self, id: &str) -> Result<bool>;

    /// Insert or update a task by id, including its label set.
    ///
    /// Comments are not written here; they only enter the store
    /// through [`append_comment`](TaskStore::append_comment).
    /// `ephemeral` tasks are silently skipped: the persistent store
    /// never holds them.
    async fn save_task(&mut self, task: &Task) -> Result<()>;

    /// Load one task with its labels and ordered comments.
    async fn load_task(&mut self, id: &str) -> Result<Option<Task>>;

    /// Materialise rows for an id list in the order given, in one
    /// query. Ids without a row are skipped.
    async fn load_tasks_by_ids(&mut self, ids: &[String]) -> Result<Vec<Task>>;

    /// Load every task, ordered by `(created_at, id)`.
    async fn load_all_tasks(&mut self) -> Result<Vec<Task>>;

    /// List tasks matching the filter, ordered by
    /// `(priority, created_at, id)`.
    async fn list_tasks(&mut self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Set status and completion timestamp, refreshing `updated_at`.
    ///
    /// # Returns
    /// * `Err(TaskError::NotFound)` - if no row has this id
    async fn update_task_status(
        &mut self,
        id: &str,
        status: TaskStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn update_task_title(&mut self, id: &str, title: &str) -> Result<()>;

    async fn update_task_priority(&mut self, id: &str, priority: Priority) -> Result<()>;

    async fn update_task_type(&mut self, id: &str, task_type: TaskType) -> Result<()>;

    /// Record the commits bracketing a task's working-copy diff.
    /// `None` leaves the corresponding column unchanged.
    async fn update_commit_tracking(
        &mut self,
        id: &str,
        started_at_commit: Option<&str>,
        completed_at_commit: Option<&str>,
    ) -> Result<()>;

    /// Delete a task; its labels, comments, and every edge touching it
    /// go with it atomically.
    async fn delete_task(&mut self, id: &str) -> Result<()>;

    /// Insert a dependency edge.
    ///
    /// # Returns
    /// * `Err(TaskError::DuplicateEdge)` - `(src, dst, type)` already present
    /// * `Err(TaskError::ReferentialIntegrity)` - an endpoint is missing
    async fn save_dependency(&mut self, dep: &Dependency) -> Result<()>;

    async fn delete_dependency(&mut self, src: &str, dst: &str, dep_type: DepType) -> Result<()>;

    /// Load every edge, ordered by `(src, dst, type)`.
    async fn load_all_dependencies(&mut self) -> Result<Vec<Dependency>>;

    /// Number of `blocks` edges into `id` whose source is neither
    /// `completed` nor `cancelled`.
    async fn get_blocked_by_count(&mut self, id: &str) -> Result<i64>;

    /// Destinations released when `src` stops counting as a blocker:
    /// every `dst` of a `blocks` edge from `src` that is still in
    /// `blocked` status and has no other non-terminal blocking source.
    ///
    /// `src` itself is excluded from the count, so the query is
    /// correct whether it runs before or after `src` is marked
    /// terminal (or deleted). Computed in a single query.
    async fn get_newly_unblocked_tasks(&mut self, src: &str) -> Result<Vec<String>>;

    /// Append to a task's audit trail. The comment keeps the timestamp
    /// it carries, and the task row itself is left untouched so that
    /// export/import round trips preserve `updated_at`.
    async fn append_comment(&mut self, task_id: &str, comment: &Comment) -> Result<()>;

    /// Full comment sequence, ordered by `(timestamp, insertion rank)`.
    async fn get_comments(&mut self, task_id: &str) -> Result<Vec<Comment>>;

    /// Most recent comment a given agent left on a task.
    async fn get_last_comment_from(&mut self, task_id: &str, agent: &str)
        -> Result<Option<Comment>>;

    /// Ids of tasks carrying at least one comment starting with
    /// `prefix` (exact, case-sensitive prefix).
    async fn get_tasks_with_comment_prefix(&mut self, prefix: &str) -> Result<Vec<String>>;

    async fn count_comments_with_prefix(
        &mut self,
        task_id: &str,
        agent: &str,
        prefix: &str,
    ) -> Result<i64>;

    /// The ready queue: `pending`, non-container tasks with zero
    /// non-terminal blocking sources, ordered by
    /// `(priority, created_at, id)`. Computed in a single query.
    async fn get_ready_tasks(&mut self) -> Result<Vec<Task>>;

    /// Task tally for the four working statuses.
    async fn get_task_counts(&mut self) -> Result<TaskCounts>;

    /// Direct children of a container, ordered like
    /// [`list_tasks`](TaskStore::list_tasks).
    async fn get_children(&mut self, parent_id: &str) -> Result<Vec<Task>>;

    /// Tasks sharing `id`'s parent (or sharing "no parent"),
    /// excluding `id` itself.
    async fn get_siblings(&mut self, id: &str) -> Result<Vec<Task>>;

    /// Source tasks of `blocks` edges into `id`.
    async fn get_blocked_by(&mut self, id: &str) -> Result<Vec<Task>>;

    /// Destination tasks of `blocks` edges out of `id`.
    async fn get_blocking(&mut self, id: &str) -> Result<Vec<Task>>;

    /// Destination ids of `blocks` edges out of `id`.
    async fn get_blocking_task_ids(&mut self, id: &str) -> Result<Vec<String>>;

    /// Aggregate progress of a container's direct children.
    ///
    /// # Returns
    /// * `Err(TaskError::NotFound)` - if the container id is missing
    async fn get_container_summary(&mut self, id: &str) -> Result<ContainerSummary>;

    /// Open a transaction. Nested calls push savepoints, so an inner
    /// rollback discards only the inner work.
    async fn begin_transaction(&mut self) -> Result<()>;

    /// Commit the innermost open transaction or savepoint.
    async fn commit_transaction(&mut self) -> Result<()>;

    /// Roll back the innermost open transaction or savepoint.
    async fn rollback_transaction(&mut self) -> Result<()>;

    /// Upsert the singleton session record.
    async fn save_session_state(&mut self, state: &SessionState) -> Result<()>;

    async fn load_session_state(&mut self) -> Result<Option<SessionState>>;

    /// Connectivity probe for monitoring.
    async fn health_check(&mut self) -> Result<()>;
}
