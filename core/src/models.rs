use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Core task representation in the work-queue engine.
///
/// A task is a unit of work that agents discover, execute, and audit.
/// Each task has a deterministic 8-character hex id derived from its
/// title and creation time, a lifecycle status, and an append-only
/// comment trail.
///
/// # Examples
///
/// ```rust
/// use foreman_core::models::{Priority, Task, TaskStatus, TaskType};
///
/// let task = Task::new("a1b2c3d4", "Wire up the review agent", foreman_core::models::now_secs());
/// assert_eq!(task.status, TaskStatus::Pending);
/// assert_eq!(task.priority, Priority::Medium);
/// assert_eq!(task.task_type, TaskType::Task);
/// assert!(task.completed_at.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// 8-character lowercase hex id, derived from `(title, created_at)`
    pub id: String,
    /// Brief task title, never empty
    pub title: String,
    /// Detailed requirements, if any
    pub description: Option<String>,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Scheduling priority; lower rank is more urgent
    pub priority: Priority,
    /// Kind of work this task represents
    pub task_type: TaskType,
    /// Containing task, for children of a `container`
    pub parent_id: Option<String>,
    /// Unordered set of short classification labels
    #[serde(default)]
    pub labels: Vec<String>,
    /// Creation timestamp (epoch-second precision)
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    /// Refreshed on every successful mutation
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
    /// Set exactly while status is `completed`
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Commit identifier recorded when work started
    pub started_at_commit: Option<String>,
    /// Commit identifier recorded when work was submitted
    pub completed_at_commit: Option<String>,
    /// Append-only audit trail, ordered by `(timestamp, insertion rank)`
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Task {
    /// Create a fresh `pending` task with default priority and type.
    pub fn new(id: impl Into<String>, title: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            task_type: TaskType::Task,
            parent_id: None,
            labels: Vec::new(),
            created_at,
            updated_at: created_at,
            completed_at: None,
            started_at_commit: None,
            completed_at_commit: None,
            comments: Vec::new(),
        }
    }

    /// Check whether the task may move to `new_status`.
    ///
    /// Terminal statuses (`completed`, `cancelled`) are sticky: once a
    /// task is terminal no further status change is accepted, which is
    /// also what keeps the blocking graph free of cycles re-introduced
    /// by reopening. Every other transition is driven by explicit API
    /// calls and the dependency protocol and is allowed here.
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        match (self.status, new_status) {
            // no transitions out of a terminal status
            (TaskStatus::Completed | TaskStatus::Cancelled, _) => false,
            _ => true,
        }
    }

    /// A task is workable when an agent could pick it as the current
    /// task: status `pending` or `in_progress`, and not a container.
    pub fn is_workable(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::InProgress)
            && self.task_type != TaskType::Container
    }
}

/// Task lifecycle statuses.
///
/// `pending` is the initial status. `completed` and `cancelled` are
/// terminal. `blocked` is owned by the dependency protocol: adding a
/// `blocks` edge with a non-terminal source moves a `pending`
/// destination to `blocked`, and the cascade-unblock wave moves it
/// back once the last non-terminal blocker goes away.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses accept no further transitions and stop
    /// counting toward `blocked_by_count`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Stable lowercase wire name, shared by SQLite and JSONL.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "blocked" => Some(TaskStatus::Blocked),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered priority scale; lower rank is more urgent.
///
/// ```rust
/// use foreman_core::models::Priority;
///
/// assert!(Priority::Critical < Priority::High);
/// assert!(Priority::Low < Priority::Wishlist);
/// assert_eq!(Priority::Medium.rank(), 2);
/// ```
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
    Wishlist = 4,
}

impl Priority {
    /// Numeric rank used for storage and sorting.
    pub fn rank(self) -> i64 {
        self as i64
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Priority::Critical),
            1 => Some(Priority::High),
            2 => Some(Priority::Medium),
            3 => Some(Priority::Low),
            4 => Some(Priority::Wishlist),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Wishlist => "wishlist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Priority::Critical),
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            "wishlist" => Some(Priority::Wishlist),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a task represents.
///
/// `container` tasks group children and are never blocked nor ready.
/// `ephemeral` tasks live only in process memory and are silently
/// dropped by the persistence layer.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Task,
    Bug,
    Feature,
    Research,
    Ephemeral,
    Container,
}

impl TaskType {
    pub fn is_container(self) -> bool {
        self == TaskType::Container
    }

    pub fn is_ephemeral(self) -> bool {
        self == TaskType::Ephemeral
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Task => "task",
            TaskType::Bug => "bug",
            TaskType::Feature => "feature",
            TaskType::Research => "research",
            TaskType::Ephemeral => "ephemeral",
            TaskType::Container => "container",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(TaskType::Task),
            "bug" => Some(TaskType::Bug),
            "feature" => Some(TaskType::Feature),
            "research" => Some(TaskType::Research),
            "ephemeral" => Some(TaskType::Ephemeral),
            "container" => Some(TaskType::Container),
            _ => None,
        }
    }
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Task
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed dependency edge `src → dst`.
///
/// The invariants `src ≠ dst` and `(src, dst, type)` unique are
/// enforced by the facade and the store respectively. Adding a
/// `blocks` edge that would close a forward cycle in the blocking
/// subgraph is rejected before it reaches the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dependency {
    pub src_id: String,
    pub dst_id: String,
    pub dep_type: DepType,
    /// Reserved; always 1.0 today
    pub weight: f64,
}

impl Dependency {
    pub fn new(src_id: impl Into<String>, dst_id: impl Into<String>, dep_type: DepType) -> Self {
        Self {
            src_id: src_id.into(),
            dst_id: dst_id.into(),
            dep_type,
            weight: 1.0,
        }
    }
}

/// Dependency edge kinds.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DepType {
    /// `dst` cannot leave `blocked` while `src` is non-terminal
    Blocks,
    /// `src` is the container of `dst`
    Parent,
    Related,
    Provenance,
}

impl DepType {
    pub fn as_str(self) -> &'static str {
        match self {
            DepType::Blocks => "blocks",
            DepType::Parent => "parent",
            DepType::Related => "related",
            DepType::Provenance => "provenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blocks" => Some(DepType::Blocks),
            "parent" => Some(DepType::Parent),
            "related" => Some(DepType::Related),
            "provenance" => Some(DepType::Provenance),
            _ => None,
        }
    }
}

impl std::fmt::Display for DepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a task's append-only audit trail.
///
/// Comments are never edited or deleted through the public API.
/// Two comments appended within the same second keep their append
/// order (the store's insertion rank breaks the tie).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    /// Agent that wrote the comment
    pub agent: String,
    pub content: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl Comment {
    pub fn new(agent: impl Into<String>, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            agent: agent.into(),
            content: content.into(),
            timestamp,
        }
    }
}

/// Singleton session record, persisted so cold starts can resume.
///
/// `session_id` has the format `<epoch-seconds>-<4 hex chars>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub session_id: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub started_at: DateTime<Utc>,
    pub current_task_id: Option<String>,
    pub notes: Option<String>,
}

/// Data transfer object for creating new tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    /// Required non-empty title
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub labels: Vec<String>,
    pub parent_id: Option<String>,
    /// Ids that must complete before this task becomes ready; a
    /// `blocks` edge is added from each in the creation transaction
    #[serde(default)]
    pub must_complete_first: Vec<String>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn after(mut self, blocker_id: impl Into<String>) -> Self {
        self.must_complete_first.push(blocker_id.into());
        self
    }
}

/// Batch update applied in a single transaction; only `Some` fields
/// change. A status change to `completed` runs the same
/// cascade-unblock wave as completing the task directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub priority: Option<Priority>,
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
}

/// Filter criteria for querying tasks; fields combine with AND logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub task_type: Option<TaskType>,
    pub parent_id: Option<String>,
    /// Restrict to ready tasks: `pending`, non-container, zero
    /// non-terminal blocking sources
    #[serde(default)]
    pub ready_only: bool,
    pub label: Option<String>,
    /// ASCII case-insensitive substring match over title and
    /// description
    pub search: Option<String>,
}

impl TaskFilter {
    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn ready() -> Self {
        Self {
            ready_only: true,
            ..Default::default()
        }
    }
}

/// Outcome of completing a task: the completed id and every
/// destination released by the cascade-unblock wave.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompleteResult {
    pub id: String,
    pub unblocked: Vec<String>,
}

/// Task tally by status, for dashboards.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub blocked: u64,
}

/// Aggregate progress of a container's direct children.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerSummary {
    pub total: u64,
    pub completed: u64,
    pub blocked: u64,
    pub in_progress: u64,
    pub percent_complete: f64,
}

/// Current instant truncated to whole seconds.
///
/// All engine timestamps carry epoch-second precision so that the
/// store, the JSONL wire format, and in-memory values compare equal.
pub fn now_secs() -> DateTime<Utc> {
    // the current instant is always representable
    DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_default()
}
