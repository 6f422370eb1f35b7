use chrono::{DateTime, Utc};
use foreman_core::{
    error::{Result, TaskError},
    models::{Comment, Dependency, DepType, Priority, SessionState, Task, TaskFilter, TaskStatus,
        TaskType},
};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

/// Columns selected whenever a full task row is materialised.
pub const TASK_COLUMNS: &str = "id, title, description, status, priority, task_type, parent_id, \
     created_at, updated_at, completed_at, started_at_commit, completed_at_commit";

/// Same columns qualified with the `t` alias, for joined queries.
pub const TASK_COLUMNS_T: &str = "t.id, t.title, t.description, t.status, t.priority, \
     t.task_type, t.parent_id, t.created_at, t.updated_at, t.completed_at, \
     t.started_at_commit, t.completed_at_commit";

/// Convert a stored status string back to the enum.
pub fn string_to_status(s: &str) -> Result<TaskStatus> {
    TaskStatus::parse(s)
        .ok_or_else(|| TaskError::Storage(format!("invalid task status in database: {s}")))
}

pub fn string_to_type(s: &str) -> Result<TaskType> {
    TaskType::parse(s)
        .ok_or_else(|| TaskError::Storage(format!("invalid task type in database: {s}")))
}

pub fn string_to_dep_type(s: &str) -> Result<DepType> {
    DepType::parse(s)
        .ok_or_else(|| TaskError::Storage(format!("invalid dependency type in database: {s}")))
}

pub fn rank_to_priority(rank: i64) -> Result<Priority> {
    Priority::from_rank(rank)
        .ok_or_else(|| TaskError::Storage(format!("invalid priority rank in database: {rank}")))
}

/// Convert an epoch-second column to a timestamp.
pub fn secs_to_datetime(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| TaskError::Storage(format!("timestamp out of range: {secs}")))
}

/// Convert a SQLite row to a Task. Labels and comments are attached by
/// the caller; a bare row has empty collections.
pub fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let status_str: String = row.get("status");
    let type_str: String = row.get("task_type");
    let completed_at: Option<i64> = row.get("completed_at");

    Ok(Task {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        status: string_to_status(&status_str)?,
        priority: rank_to_priority(row.get("priority"))?,
        task_type: string_to_type(&type_str)?,
        parent_id: row.get("parent_id"),
        labels: Vec::new(),
        created_at: secs_to_datetime(row.get("created_at"))?,
        updated_at: secs_to_datetime(row.get("updated_at"))?,
        completed_at: completed_at.map(secs_to_datetime).transpose()?,
        started_at_commit: row.get("started_at_commit"),
        completed_at_commit: row.get("completed_at_commit"),
        comments: Vec::new(),
    })
}

pub fn row_to_comment(row: &SqliteRow) -> Result<Comment> {
    Ok(Comment {
        agent: row.get("agent"),
        content: row.get("content"),
        timestamp: secs_to_datetime(row.get("created_at"))?,
    })
}

pub fn row_to_dependency(row: &SqliteRow) -> Result<Dependency> {
    let type_str: String = row.get("dep_type");
    Ok(Dependency {
        src_id: row.get("src_id"),
        dst_id: row.get("dst_id"),
        dep_type: string_to_dep_type(&type_str)?,
        weight: row.get("weight"),
    })
}

pub fn row_to_session_state(row: &SqliteRow) -> Result<SessionState> {
    Ok(SessionState {
        session_id: row.get("session_id"),
        started_at: secs_to_datetime(row.get("started_at"))?,
        current_task_id: row.get("current_task_id"),
        notes: row.get("notes"),
    })
}

/// True when the error is a SQLite uniqueness violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            code == "2067" || code == "1555" || db_err.message().contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}

/// True when the error is a SQLite foreign-key violation.
pub fn is_fk_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            code == "787" || db_err.message().contains("FOREIGN KEY constraint failed")
        }
        _ => false,
    }
}

/// Convert a sqlx error to the engine error vocabulary. Callers that
/// can name the violated constraint (duplicate edge, id collision)
/// check [`is_unique_violation`] before falling back to this.
pub fn sqlx_error_to_task_error(err: sqlx::Error) -> TaskError {
    if is_fk_violation(&err) {
        return TaskError::ReferentialIntegrity(format!("{err}"));
    }
    match &err {
        sqlx::Error::Database(db_err) => {
            TaskError::Storage(format!("database constraint error: {}", db_err.message()))
        }
        sqlx::Error::PoolTimedOut => TaskError::Storage("connection pool timeout".to_string()),
        sqlx::Error::Io(io_err) => TaskError::Storage(format!("database I/O error: {io_err}")),
        _ => TaskError::Storage(format!("database operation failed: {err}")),
    }
}

/// SQL fragment selecting only ready tasks: pending, non-container,
/// and free of non-terminal blocking sources.
pub const READY_PREDICATE: &str = "t.status = 'pending' AND t.task_type <> 'container' \
     AND NOT EXISTS (\
         SELECT 1 FROM dependencies d \
         JOIN tasks s ON s.id = d.src_id \
         WHERE d.dst_id = t.id AND d.dep_type = 'blocks' \
           AND s.status NOT IN ('completed', 'cancelled'))";

/// Build the filtered task listing query with proper type binding.
pub fn build_filter_query(filter: &TaskFilter) -> QueryBuilder<'_, Sqlite> {
    let mut query_builder: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {TASK_COLUMNS_T} FROM tasks t WHERE 1 = 1"));

    if let Some(status) = filter.status {
        query_builder.push(" AND t.status = ");
        query_builder.push_bind(status.as_str());
    }

    if let Some(priority) = filter.priority {
        query_builder.push(" AND t.priority = ");
        query_builder.push_bind(priority.rank());
    }

    if let Some(task_type) = filter.task_type {
        query_builder.push(" AND t.task_type = ");
        query_builder.push_bind(task_type.as_str());
    }

    if let Some(ref parent_id) = filter.parent_id {
        query_builder.push(" AND t.parent_id = ");
        query_builder.push_bind(parent_id);
    }

    if let Some(ref label) = filter.label {
        query_builder.push(
            " AND EXISTS (SELECT 1 FROM task_labels l WHERE l.task_id = t.id AND l.label = ",
        );
        query_builder.push_bind(label);
        query_builder.push(")");
    }

    if let Some(ref search) = filter.search {
        // SQLite LIKE is ASCII case-insensitive, which is the
        // documented matching rule for free-text search
        query_builder.push(" AND (t.title LIKE '%' || ");
        query_builder.push_bind(search);
        query_builder.push(" || '%' OR t.description LIKE '%' || ");
        query_builder.push_bind(search);
        query_builder.push(" || '%')");
    }

    if filter.ready_only {
        query_builder.push(" AND ");
        query_builder.push(READY_PREDICATE);
    }

    query_builder.push(" ORDER BY t.priority ASC, t.created_at ASC, t.id ASC");

    query_builder
}
