use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{
    error::{Result, TaskError},
    models::{
        now_secs, Comment, ContainerSummary, Dependency, DepType, Priority, SessionState, Task,
        TaskCounts, TaskFilter, TaskStatus, TaskType,
    },
    store::TaskStore,
};
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, Transaction,
};

use crate::common::{
    build_filter_query, is_unique_violation, row_to_comment, row_to_dependency,
    row_to_session_state, row_to_task, sqlx_error_to_task_error, READY_PREDICATE, TASK_COLUMNS,
    TASK_COLUMNS_T,
};

/// SQLite implementation of the [`TaskStore`] contract.
///
/// The store runs over a single pooled connection: the engine is
/// single-threaded by design, file databases get WAL journaling for
/// crash safety, and in-memory databases survive for the store's
/// lifetime because their one connection is never recycled.
///
/// Explicit transactions are held inside the store; while one is open
/// every operation routes through it, and nested `begin` calls map
/// onto SQLite savepoints.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    savepoint_depth: u32,
}

/// Connection handle for one store operation: either the open
/// transaction or a connection checked out of the pool.
enum StoreConn<'a> {
    Pooled(PoolConnection<Sqlite>),
    Tx(&'a mut SqliteConnection),
}

impl Deref for StoreConn<'_> {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        match self {
            StoreConn::Pooled(conn) => conn,
            StoreConn::Tx(conn) => conn,
        }
    }
}

impl DerefMut for StoreConn<'_> {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        match self {
            StoreConn::Pooled(conn) => conn,
            StoreConn::Tx(conn) => conn,
        }
    }
}

impl SqliteStore {
    /// Open (and create if missing) the store at `database_url`.
    ///
    /// Accepts a plain file path, a `sqlite://` URL, or `:memory:`.
    ///
    /// # Examples
    /// ```rust,no_run
    /// use foreman_store::SqliteStore;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = SqliteStore::new(":memory:").await?;
    /// store.migrate().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = if database_url.contains(":memory:") {
            SqliteConnectOptions::new()
                .in_memory(true)
                .foreign_keys(true)
                .busy_timeout(Duration::from_secs(5))
        } else {
            let path = database_url.trim_start_matches("sqlite://");
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true)
                .busy_timeout(Duration::from_secs(5))
        };

        // one connection: single-threaded callers, and in-memory
        // databases vanish when their connection is recycled
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(sqlx_error_to_task_error)?;

        tracing::info!(database_url, "opened task store");

        Ok(Self {
            pool,
            tx: None,
            savepoint_depth: 0,
        })
    }

    /// Apply pending migrations. Call once after opening.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TaskError::Storage(format!("migration failed: {e}")))?;

        tracing::info!("database migrations completed");
        Ok(())
    }

    /// Direct pool access, intended for tests and benchmarks.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn acquire(&mut self) -> Result<StoreConn<'_>> {
        match self.tx.as_deref_mut() {
            Some(conn) => Ok(StoreConn::Tx(conn)),
            None => {
                let conn = self
                    .pool
                    .acquire()
                    .await
                    .map_err(sqlx_error_to_task_error)?;
                Ok(StoreConn::Pooled(conn))
            }
        }
    }
}

/// Load labels and comments for every task in `tasks` with two batched
/// queries, then attach them in place.
async fn attach_details(conn: &mut SqliteConnection, tasks: &mut [Task]) -> Result<()> {
    if tasks.is_empty() {
        return Ok(());
    }
    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

    let mut label_query: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT task_id, label FROM task_labels WHERE task_id IN (");
    {
        let mut separated = label_query.separated(", ");
        for id in &ids {
            separated.push_bind(*id);
        }
    }
    label_query.push(") ORDER BY task_id, label");
    let label_rows = label_query
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

    let mut labels: HashMap<String, Vec<String>> = HashMap::new();
    for row in &label_rows {
        labels
            .entry(row.get("task_id"))
            .or_default()
            .push(row.get("label"));
    }

    let mut comment_query: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT task_id, agent, content, created_at FROM comments WHERE task_id IN (",
    );
    {
        let mut separated = comment_query.separated(", ");
        for id in &ids {
            separated.push_bind(*id);
        }
    }
    comment_query.push(") ORDER BY created_at ASC, id ASC");
    let comment_rows = comment_query
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

    let mut comments: HashMap<String, Vec<Comment>> = HashMap::new();
    for row in &comment_rows {
        comments
            .entry(row.get("task_id"))
            .or_default()
            .push(row_to_comment(row)?);
    }

    for task in tasks.iter_mut() {
        task.labels = labels.remove(&task.id).unwrap_or_default();
        task.comments = comments.remove(&task.id).unwrap_or_default();
    }
    Ok(())
}

async fn fetch_task(conn: &mut SqliteConnection, id: &str) -> Result<Option<Task>> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

    match row {
        Some(row) => {
            let mut tasks = vec![row_to_task(&row)?];
            attach_details(conn, &mut tasks).await?;
            Ok(tasks.pop())
        }
        None => Ok(None),
    }
}

async fn require_task(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    let row = sqlx::query("SELECT 1 FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;
    if row.is_some() {
        Ok(())
    } else {
        Err(TaskError::not_found_task(id))
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn task_exists(&mut self, id: &str) -> Result<bool> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query("SELECT 1 FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(row.is_some())
    }

    async fn save_task(&mut self, task: &Task) -> Result<()> {
        if task.task_type.is_ephemeral() {
            tracing::debug!(task_id = %task.id, "skipping persistence of ephemeral task");
            return Ok(());
        }

        let mut conn = self.acquire().await?;
        sqlx::query(
            "INSERT INTO tasks (id, title, description, status, priority, task_type, parent_id, \
             created_at, updated_at, completed_at, started_at_commit, completed_at_commit) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             title = excluded.title, description = excluded.description, \
             status = excluded.status, priority = excluded.priority, \
             task_type = excluded.task_type, parent_id = excluded.parent_id, \
             updated_at = excluded.updated_at, completed_at = excluded.completed_at, \
             started_at_commit = excluded.started_at_commit, \
             completed_at_commit = excluded.completed_at_commit",
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(task.description.as_deref())
        .bind(task.status.as_str())
        .bind(task.priority.rank())
        .bind(task.task_type.as_str())
        .bind(task.parent_id.as_deref())
        .bind(task.created_at.timestamp())
        .bind(task.updated_at.timestamp())
        .bind(task.completed_at.map(|t| t.timestamp()))
        .bind(task.started_at_commit.as_deref())
        .bind(task.completed_at_commit.as_deref())
        .execute(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        sqlx::query("DELETE FROM task_labels WHERE task_id = ?")
            .bind(&task.id)
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;
        for label in &task.labels {
            sqlx::query("INSERT OR IGNORE INTO task_labels (task_id, label) VALUES (?, ?)")
                .bind(&task.id)
                .bind(label)
                .execute(&mut *conn)
                .await
                .map_err(sqlx_error_to_task_error)?;
        }
        Ok(())
    }

    async fn load_task(&mut self, id: &str) -> Result<Option<Task>> {
        let mut conn = self.acquire().await?;
        fetch_task(&mut conn, id).await
    }

    async fn load_tasks_by_ids(&mut self, ids: &[String]) -> Result<Vec<Task>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.acquire().await?;

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id IN ("));
        {
            let mut separated = query.separated(", ");
            for id in ids {
                separated.push_bind(id);
            }
        }
        query.push(")");
        let rows = query
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(row_to_task(row)?);
        }
        attach_details(&mut conn, &mut tasks).await?;

        // back to the caller's order; ids without a row are skipped
        let mut by_id: HashMap<String, Task> =
            tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn load_all_tasks(&mut self) -> Result<Vec<Task>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(row_to_task(row)?);
        }
        attach_details(&mut conn, &mut tasks).await?;
        Ok(tasks)
    }

    async fn list_tasks(&mut self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut conn = self.acquire().await?;
        let mut query = build_filter_query(filter);
        let rows = query
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(row_to_task(row)?);
        }
        attach_details(&mut conn, &mut tasks).await?;
        Ok(tasks)
    }

    async fn update_task_status(
        &mut self,
        id: &str,
        status: TaskStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, completed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(completed_at.map(|t| t.timestamp()))
        .bind(now_secs().timestamp())
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        if result.rows_affected() == 0 {
            return Err(TaskError::not_found_task(id));
        }
        Ok(())
    }

    async fn update_task_title(&mut self, id: &str, title: &str) -> Result<()> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query("UPDATE tasks SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(now_secs().timestamp())
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;

        if result.rows_affected() == 0 {
            return Err(TaskError::not_found_task(id));
        }
        Ok(())
    }

    async fn update_task_priority(&mut self, id: &str, priority: Priority) -> Result<()> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query("UPDATE tasks SET priority = ?, updated_at = ? WHERE id = ?")
            .bind(priority.rank())
            .bind(now_secs().timestamp())
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;

        if result.rows_affected() == 0 {
            return Err(TaskError::not_found_task(id));
        }
        Ok(())
    }

    async fn update_task_type(&mut self, id: &str, task_type: TaskType) -> Result<()> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query("UPDATE tasks SET task_type = ?, updated_at = ? WHERE id = ?")
            .bind(task_type.as_str())
            .bind(now_secs().timestamp())
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;

        if result.rows_affected() == 0 {
            return Err(TaskError::not_found_task(id));
        }
        Ok(())
    }

    async fn update_commit_tracking(
        &mut self,
        id: &str,
        started_at_commit: Option<&str>,
        completed_at_commit: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            "UPDATE tasks SET started_at_commit = COALESCE(?, started_at_commit), \
             completed_at_commit = COALESCE(?, completed_at_commit), updated_at = ? \
             WHERE id = ?",
        )
        .bind(started_at_commit)
        .bind(completed_at_commit)
        .bind(now_secs().timestamp())
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        if result.rows_affected() == 0 {
            return Err(TaskError::not_found_task(id));
        }
        Ok(())
    }

    async fn delete_task(&mut self, id: &str) -> Result<()> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;

        if result.rows_affected() == 0 {
            return Err(TaskError::not_found_task(id));
        }
        Ok(())
    }

    async fn save_dependency(&mut self, dep: &Dependency) -> Result<()> {
        let mut conn = self.acquire().await?;
        sqlx::query(
            "INSERT INTO dependencies (src_id, dst_id, dep_type, weight) VALUES (?, ?, ?, ?)",
        )
        .bind(&dep.src_id)
        .bind(&dep.dst_id)
        .bind(dep.dep_type.as_str())
        .bind(dep.weight)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TaskError::DuplicateEdge(dep.src_id.clone(), dep.dst_id.clone(), dep.dep_type)
            } else {
                sqlx_error_to_task_error(e)
            }
        })?;
        Ok(())
    }

    async fn delete_dependency(&mut self, src: &str, dst: &str, dep_type: DepType) -> Result<()> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            "DELETE FROM dependencies WHERE src_id = ? AND dst_id = ? AND dep_type = ?",
        )
        .bind(src)
        .bind(dst)
        .bind(dep_type.as_str())
        .execute(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        if result.rows_affected() == 0 {
            return Err(TaskError::dependency_not_found(src, dst, dep_type));
        }
        Ok(())
    }

    async fn load_all_dependencies(&mut self) -> Result<Vec<Dependency>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            "SELECT src_id, dst_id, dep_type, weight FROM dependencies \
             ORDER BY src_id, dst_id, dep_type",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        rows.iter().map(row_to_dependency).collect()
    }

    async fn get_blocked_by_count(&mut self, id: &str) -> Result<i64> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM dependencies d \
             JOIN tasks s ON s.id = d.src_id \
             WHERE d.dst_id = ? AND d.dep_type = 'blocks' \
               AND s.status NOT IN ('completed', 'cancelled')",
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        Ok(row.get("n"))
    }

    async fn get_newly_unblocked_tasks(&mut self, src: &str) -> Result<Vec<String>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            "SELECT d.dst_id FROM dependencies d \
             JOIN tasks dt ON dt.id = d.dst_id \
             WHERE d.src_id = ? AND d.dep_type = 'blocks' AND dt.status = 'blocked' \
               AND NOT EXISTS (\
                   SELECT 1 FROM dependencies o \
                   JOIN tasks s ON s.id = o.src_id \
                   WHERE o.dst_id = d.dst_id AND o.dep_type = 'blocks' \
                     AND o.src_id <> d.src_id \
                     AND s.status NOT IN ('completed', 'cancelled')) \
             ORDER BY d.dst_id",
        )
        .bind(src)
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        Ok(rows.iter().map(|row| row.get("dst_id")).collect())
    }

    async fn append_comment(&mut self, task_id: &str, comment: &Comment) -> Result<()> {
        let mut conn = self.acquire().await?;
        require_task(&mut conn, task_id).await?;

        sqlx::query("INSERT INTO comments (task_id, agent, content, created_at) VALUES (?, ?, ?, ?)")
            .bind(task_id)
            .bind(&comment.agent)
            .bind(&comment.content)
            .bind(comment.timestamp.timestamp())
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    async fn get_comments(&mut self, task_id: &str) -> Result<Vec<Comment>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            "SELECT agent, content, created_at FROM comments \
             WHERE task_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        rows.iter().map(row_to_comment).collect()
    }

    async fn get_last_comment_from(
        &mut self,
        task_id: &str,
        agent: &str,
    ) -> Result<Option<Comment>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(
            "SELECT agent, content, created_at FROM comments \
             WHERE task_id = ? AND agent = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(task_id)
        .bind(agent)
        .fetch_optional(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        row.as_ref().map(row_to_comment).transpose()
    }

    async fn get_tasks_with_comment_prefix(&mut self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            "SELECT DISTINCT task_id FROM comments \
             WHERE substr(content, 1, ?) = ? ORDER BY task_id",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        Ok(rows.iter().map(|row| row.get("task_id")).collect())
    }

    async fn count_comments_with_prefix(
        &mut self,
        task_id: &str,
        agent: &str,
        prefix: &str,
    ) -> Result<i64> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM comments \
             WHERE task_id = ? AND agent = ? AND substr(content, 1, ?) = ?",
        )
        .bind(task_id)
        .bind(agent)
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_one(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        Ok(row.get("n"))
    }

    async fn get_ready_tasks(&mut self) -> Result<Vec<Task>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS_T} FROM tasks t WHERE {READY_PREDICATE} \
             ORDER BY t.priority ASC, t.created_at ASC, t.id ASC"
        ))
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(row_to_task(row)?);
        }
        attach_details(&mut conn, &mut tasks).await?;
        Ok(tasks)
    }

    async fn get_task_counts(&mut self) -> Result<TaskCounts> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;

        let mut counts = TaskCounts::default();
        for row in &rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.as_str() {
                "pending" => counts.pending = n as u64,
                "in_progress" => counts.in_progress = n as u64,
                "completed" => counts.completed = n as u64,
                "blocked" => counts.blocked = n as u64,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn get_children(&mut self, parent_id: &str) -> Result<Vec<Task>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = ? \
             ORDER BY priority ASC, created_at ASC, id ASC"
        ))
        .bind(parent_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(row_to_task(row)?);
        }
        attach_details(&mut conn, &mut tasks).await?;
        Ok(tasks)
    }

    async fn get_siblings(&mut self, id: &str) -> Result<Vec<Task>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS_T} FROM tasks t \
             JOIN tasks me ON me.id = ? \
             WHERE t.id <> me.id \
               AND ((me.parent_id IS NULL AND t.parent_id IS NULL) \
                    OR t.parent_id = me.parent_id) \
             ORDER BY t.priority ASC, t.created_at ASC, t.id ASC"
        ))
        .bind(id)
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(row_to_task(row)?);
        }
        attach_details(&mut conn, &mut tasks).await?;
        Ok(tasks)
    }

    async fn get_blocked_by(&mut self, id: &str) -> Result<Vec<Task>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS_T} FROM tasks t \
             JOIN dependencies d ON d.src_id = t.id \
             WHERE d.dst_id = ? AND d.dep_type = 'blocks' \
             ORDER BY t.priority ASC, t.created_at ASC, t.id ASC"
        ))
        .bind(id)
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(row_to_task(row)?);
        }
        attach_details(&mut conn, &mut tasks).await?;
        Ok(tasks)
    }

    async fn get_blocking(&mut self, id: &str) -> Result<Vec<Task>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS_T} FROM tasks t \
             JOIN dependencies d ON d.dst_id = t.id \
             WHERE d.src_id = ? AND d.dep_type = 'blocks' \
             ORDER BY t.priority ASC, t.created_at ASC, t.id ASC"
        ))
        .bind(id)
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(row_to_task(row)?);
        }
        attach_details(&mut conn, &mut tasks).await?;
        Ok(tasks)
    }

    async fn get_blocking_task_ids(&mut self, id: &str) -> Result<Vec<String>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            "SELECT dst_id FROM dependencies WHERE src_id = ? AND dep_type = 'blocks' \
             ORDER BY dst_id",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        Ok(rows.iter().map(|row| row.get("dst_id")).collect())
    }

    async fn get_container_summary(&mut self, id: &str) -> Result<ContainerSummary> {
        let mut conn = self.acquire().await?;
        require_task(&mut conn, id).await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
             COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed, \
             COALESCE(SUM(CASE WHEN status = 'blocked' THEN 1 ELSE 0 END), 0) AS blocked, \
             COALESCE(SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END), 0) AS in_progress \
             FROM tasks WHERE parent_id = ?",
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        let total: i64 = row.get("total");
        let completed: i64 = row.get("completed");
        let percent_complete = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(ContainerSummary {
            total: total as u64,
            completed: completed as u64,
            blocked: row.get::<i64, _>("blocked") as u64,
            in_progress: row.get::<i64, _>("in_progress") as u64,
            percent_complete,
        })
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        match self.tx.as_deref_mut() {
            Some(conn) => {
                let depth = self.savepoint_depth + 1;
                sqlx::query(&format!("SAVEPOINT sp_{depth}"))
                    .execute(&mut *conn)
                    .await
                    .map_err(sqlx_error_to_task_error)?;
                self.savepoint_depth = depth;
            }
            None => {
                let tx = self.pool.begin().await.map_err(sqlx_error_to_task_error)?;
                self.tx = Some(tx);
                self.savepoint_depth = 0;
            }
        }
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        if self.savepoint_depth > 0 {
            let depth = self.savepoint_depth;
            let conn = self.tx.as_deref_mut().ok_or_else(|| {
                TaskError::Storage("savepoint tracked without an open transaction".to_string())
            })?;
            sqlx::query(&format!("RELEASE SAVEPOINT sp_{depth}"))
                .execute(&mut *conn)
                .await
                .map_err(sqlx_error_to_task_error)?;
            self.savepoint_depth -= 1;
            return Ok(());
        }
        match self.tx.take() {
            Some(tx) => tx.commit().await.map_err(sqlx_error_to_task_error),
            None => Err(TaskError::Storage(
                "commit without an open transaction".to_string(),
            )),
        }
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        if self.savepoint_depth > 0 {
            let depth = self.savepoint_depth;
            let conn = self.tx.as_deref_mut().ok_or_else(|| {
                TaskError::RollbackFailure(
                    "savepoint tracked without an open transaction".to_string(),
                )
            })?;
            sqlx::query(&format!("ROLLBACK TO SAVEPOINT sp_{depth}"))
                .execute(&mut *conn)
                .await
                .map_err(|e| TaskError::RollbackFailure(format!("{e}")))?;
            sqlx::query(&format!("RELEASE SAVEPOINT sp_{depth}"))
                .execute(&mut *conn)
                .await
                .map_err(|e| TaskError::RollbackFailure(format!("{e}")))?;
            self.savepoint_depth -= 1;
            return Ok(());
        }
        match self.tx.take() {
            Some(tx) => tx
                .rollback()
                .await
                .map_err(|e| TaskError::RollbackFailure(format!("{e}"))),
            None => Err(TaskError::RollbackFailure(
                "rollback without an open transaction".to_string(),
            )),
        }
    }

    async fn save_session_state(&mut self, state: &SessionState) -> Result<()> {
        let mut conn = self.acquire().await?;
        sqlx::query(
            "INSERT INTO session_state (id, session_id, current_task_id, started_at, notes) \
             VALUES (1, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET session_id = excluded.session_id, \
             current_task_id = excluded.current_task_id, \
             started_at = excluded.started_at, notes = excluded.notes",
        )
        .bind(&state.session_id)
        .bind(state.current_task_id.as_deref())
        .bind(state.started_at.timestamp())
        .bind(state.notes.as_deref())
        .execute(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    async fn load_session_state(&mut self) -> Result<Option<SessionState>> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(
            "SELECT session_id, current_task_id, started_at, notes FROM session_state WHERE id = 1",
        )
        .fetch_optional(&mut *conn)
        .await
        .map_err(sqlx_error_to_task_error)?;

        row.as_ref().map(row_to_session_state).transpose()
    }

    async fn health_check(&mut self) -> Result<()> {
        let mut conn = self.acquire().await?;
        sqlx::query("SELECT 1")
            .fetch_one(&mut *conn)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }
}
