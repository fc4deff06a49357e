//! SQLite persistence layer for the orchestrator daemon.
//!
//! The single writer is the daemon process; this module is the only thing
//! that touches the database directly, so every other component (scheduler,
//! worker, merge serializer, dispatcher) goes through `Storage`. WAL mode,
//! foreign keys, and a busy timeout are set once at pool creation.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use loop_core::{
    Event, GraphSnapshot, Id, MergeStrategy, PullRequest, ReviewState, Run, RunStatus, Task,
    TaskStatus, Unit, UnitStatus,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("unit not found: {0}")]
    UnitNotFound(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("pull request not found for unit: {0}")]
    PullRequestNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Owns the SQLite connection pool and every hand-written query the
/// orchestrator issues.
pub struct Storage {
    pool: Pool<Sqlite>,
}

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Migrations compiled into the binary, applied in order. Kept alongside a
/// real `migrations/` directory so `sqlx::migrate::Migrator` can also run
/// them from disk if a deployment prefers that path.
const EMBEDDED_MIGRATIONS: &[&str] = &[include_str!("../../../migrations/0001_init.sql")];

impl Storage {
    /// Open (creating if absent) the SQLite database at `path`, enable WAL
    /// journaling, foreign keys, and a busy timeout, and apply migrations.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate_embedded().await?;
        Ok(storage)
    }

    /// In-memory pool for tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let storage = Self { pool };
        storage.migrate_embedded().await?;
        Ok(storage)
    }

    /// Apply every embedded migration, tolerating the idempotent errors
    /// SQLite raises when a statement has already been applied (duplicate
    /// column, table already exists) so this can run on every startup.
    async fn migrate_embedded(&self) -> Result<()> {
        for migration_sql in EMBEDDED_MIGRATIONS {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // ---- runs ----

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (id, status, workspace_root, specs_dir, daemon_version, error, config_json, total_units, completed_units, failed_units, blocked_units, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(run.id.to_string())
        .bind(run.status.as_str())
        .bind(&run.workspace_root)
        .bind(&run.specs_dir)
        .bind(&run.daemon_version)
        .bind(&run.error)
        .bind(&run.config_json)
        .bind(run.total_units)
        .bind(run.completed_units)
        .bind(run.failed_units)
        .bind(run.blocked_units)
        .bind(to_ts(run.created_at))
        .bind(to_ts(run.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        Ok(row.into_run())
    }

    pub async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE status = ?1 ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    pub async fn list_runs(&self) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>("SELECT * FROM runs ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    pub async fn update_run_status(&self, id: &Id, status: RunStatus, error: Option<&str>) -> Result<()> {
        let rows = sqlx::query("UPDATE runs SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4")
            .bind(status.as_str())
            .bind(error)
            .bind(to_ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Recompute and persist `total_units`/`completed_units`/`failed_units`/
    /// `blocked_units` from the current state of the `units` table.
    pub async fn refresh_run_counts(&self, run_id: &Id) -> Result<()> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM units WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        let completed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM units WHERE run_id = ?1 AND status = 'merged'",
        )
        .bind(run_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        let failed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM units WHERE run_id = ?1 AND status = 'failed'",
        )
        .bind(run_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        let blocked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM units WHERE run_id = ?1 AND status = 'blocked'",
        )
        .bind(run_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        sqlx::query(
            "UPDATE runs SET total_units = ?1, completed_units = ?2, failed_units = ?3, blocked_units = ?4, updated_at = ?5 WHERE id = ?6",
        )
        .bind(total)
        .bind(completed)
        .bind(failed)
        .bind(blocked)
        .bind(to_ts(Utc::now()))
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- units ----

    pub async fn insert_units(&self, units: &[Unit]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for unit in units {
            sqlx::query(
                "INSERT INTO units (id, run_id, unit_key, title, status, level, depends_on, spec_path, worktree_path, branch, agent_retries, baseline_retries, error, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )
            .bind(unit.id.to_string())
            .bind(unit.run_id.to_string())
            .bind(&unit.unit_key)
            .bind(&unit.title)
            .bind(unit.status.as_str())
            .bind(unit.level)
            .bind(serde_json::to_string(&unit.depends_on).unwrap_or_default())
            .bind(&unit.spec_path)
            .bind(&unit.worktree_path)
            .bind(&unit.branch)
            .bind(unit.agent_retries)
            .bind(unit.baseline_retries)
            .bind(&unit.error)
            .bind(to_ts(unit.created_at))
            .bind(to_ts(unit.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_unit(&self, id: &Id) -> Result<Unit> {
        let row = sqlx::query_as::<_, UnitRow>("SELECT * FROM units WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::UnitNotFound(id.to_string()))?;
        Ok(row.into_unit())
    }

    pub async fn list_units(&self, run_id: &Id) -> Result<Vec<Unit>> {
        let rows = sqlx::query_as::<_, UnitRow>(
            "SELECT * FROM units WHERE run_id = ?1 ORDER BY level, created_at",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UnitRow::into_unit).collect())
    }

    pub async fn update_unit(&self, unit: &Unit) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE units SET status = ?1, worktree_path = ?2, branch = ?3, agent_retries = ?4, \
             baseline_retries = ?5, error = ?6, updated_at = ?7 WHERE id = ?8",
        )
        .bind(unit.status.as_str())
        .bind(&unit.worktree_path)
        .bind(&unit.branch)
        .bind(unit.agent_retries)
        .bind(unit.baseline_retries)
        .bind(&unit.error)
        .bind(to_ts(Utc::now()))
        .bind(unit.id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(StorageError::UnitNotFound(unit.id.to_string()));
        }
        Ok(())
    }

    // ---- tasks ----

    pub async fn insert_tasks(&self, tasks: &[Task]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for task in tasks {
            sqlx::query(
                "INSERT INTO tasks (id, unit_id, task_number, title, spec_path, depends_on, validation, status, agent_retries, error, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )
            .bind(task.id.to_string())
            .bind(task.unit_id.to_string())
            .bind(task.task_number)
            .bind(&task.title)
            .bind(&task.spec_path)
            .bind(serde_json::to_string(&task.depends_on).unwrap_or_default())
            .bind(&task.validation)
            .bind(task.status.as_str())
            .bind(task.agent_retries)
            .bind(&task.error)
            .bind(to_ts(task.created_at))
            .bind(to_ts(task.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_tasks(&self, unit_id: &Id) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE unit_id = ?1 ORDER BY task_number",
        )
        .bind(unit_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TaskRow::into_task).collect())
    }

    pub async fn update_task(&self, task: &Task) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE tasks SET status = ?1, agent_retries = ?2, error = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(task.status.as_str())
        .bind(task.agent_retries)
        .bind(&task.error)
        .bind(to_ts(Utc::now()))
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(StorageError::TaskNotFound(task.id.to_string()));
        }
        Ok(())
    }

    // ---- pull requests ----

    pub async fn insert_pull_request(&self, pr: &PullRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO pull_requests (id, unit_id, number, url, source_branch, target_branch, review_state, merge_strategy, merged, merge_commit, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(pr.id.to_string())
        .bind(pr.unit_id.to_string())
        .bind(pr.number as i64)
        .bind(&pr.url)
        .bind(&pr.source_branch)
        .bind(&pr.target_branch)
        .bind(pr.review_state.as_str())
        .bind(pr.merge_strategy.as_str())
        .bind(pr.merged)
        .bind(&pr.merge_commit)
        .bind(to_ts(pr.created_at))
        .bind(to_ts(pr.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pull_request_by_unit(&self, unit_id: &Id) -> Result<PullRequest> {
        let row = sqlx::query_as::<_, PullRequestRow>(
            "SELECT * FROM pull_requests WHERE unit_id = ?1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(unit_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::PullRequestNotFound(unit_id.to_string()))?;
        Ok(row.into_pr())
    }

    pub async fn update_pull_request(&self, pr: &PullRequest) -> Result<()> {
        sqlx::query(
            "UPDATE pull_requests SET review_state = ?1, merged = ?2, merge_commit = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(pr.review_state.as_str())
        .bind(pr.merged)
        .bind(&pr.merge_commit)
        .bind(to_ts(Utc::now()))
        .bind(pr.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- events ----

    /// Append an event, assigning it the next sequence number for its run.
    /// Sequence numbers are strictly increasing per run and persist across
    /// restarts because they are derived from the max stored sequence.
    pub async fn append_event(
        &self,
        run_id: &Id,
        unit_id: Option<&Id>,
        event_type: &str,
        payload_json: &str,
    ) -> Result<Event> {
        let mut tx = self.pool.begin().await?;
        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE run_id = ?1",
        )
        .bind(run_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        let event = Event {
            id: Id::new(),
            run_id: run_id.clone(),
            unit_id: unit_id.cloned(),
            sequence: next_seq,
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            payload_json: payload_json.to_string(),
        };

        sqlx::query(
            "INSERT INTO events (id, run_id, unit_id, sequence, type, ts, payload_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(event.id.to_string())
        .bind(event.run_id.to_string())
        .bind(event.unit_id.as_ref().map(Id::to_string))
        .bind(event.sequence)
        .bind(&event.event_type)
        .bind(to_ts(event.timestamp))
        .bind(&event.payload_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(event)
    }

    /// Highest event sequence number persisted for this run so far, or 0 if
    /// none. Used by resume to stamp a `ResumeMarker` with the last sequence
    /// observed before the daemon restarted.
    pub async fn max_event_sequence(&self, run_id: &Id) -> Result<i64> {
        let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM events WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    pub async fn list_events_since(&self, run_id: &Id, after_sequence: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE run_id = ?1 AND sequence > ?2 ORDER BY sequence",
        )
        .bind(run_id.to_string())
        .bind(after_sequence)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    // ---- graph snapshots ----

    pub async fn insert_graph_snapshot(&self, graph: &GraphSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO graph_snapshots (run_id, nodes_json, edges_json, levels_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(graph.run_id.to_string())
        .bind(serde_json::to_string(&graph.nodes).unwrap_or_default())
        .bind(serde_json::to_string(&graph.edges).unwrap_or_default())
        .bind(serde_json::to_string(&graph.levels).unwrap_or_default())
        .bind(to_ts(graph.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_graph_snapshot(&self, run_id: &Id) -> Result<Option<GraphSnapshot>> {
        let row = sqlx::query_as::<_, GraphRow>("SELECT * FROM graph_snapshots WHERE run_id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(GraphRow::into_snapshot))
    }
}

#[derive(FromRow)]
struct RunRow {
    id: String,
    status: String,
    workspace_root: String,
    specs_dir: String,
    daemon_version: String,
    error: Option<String>,
    config_json: Option<String>,
    total_units: i64,
    completed_units: i64,
    failed_units: i64,
    blocked_units: i64,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn into_run(self) -> Run {
        Run {
            id: Id::from_string(self.id),
            status: parse_run_status(&self.status),
            workspace_root: self.workspace_root,
            specs_dir: self.specs_dir,
            daemon_version: self.daemon_version,
            error: self.error,
            config_json: self.config_json,
            total_units: self.total_units,
            completed_units: self.completed_units,
            failed_units: self.failed_units,
            blocked_units: self.blocked_units,
            created_at: from_ts(self.created_at),
            updated_at: from_ts(self.updated_at),
        }
    }
}

fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "stopped" => RunStatus::Stopped,
        _ => RunStatus::Running,
    }
}

#[derive(FromRow)]
struct UnitRow {
    id: String,
    run_id: String,
    unit_key: String,
    title: String,
    status: String,
    level: i64,
    depends_on: String,
    spec_path: String,
    worktree_path: Option<String>,
    branch: Option<String>,
    agent_retries: i64,
    baseline_retries: i64,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl UnitRow {
    fn into_unit(self) -> Unit {
        Unit {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            unit_key: self.unit_key,
            title: self.title,
            status: parse_unit_status(&self.status),
            level: self.level,
            depends_on: serde_json::from_str(&self.depends_on).unwrap_or_default(),
            spec_path: self.spec_path,
            worktree_path: self.worktree_path,
            branch: self.branch,
            agent_retries: self.agent_retries as u32,
            baseline_retries: self.baseline_retries as u32,
            error: self.error,
            created_at: from_ts(self.created_at),
            updated_at: from_ts(self.updated_at),
        }
    }
}

fn parse_unit_status(s: &str) -> UnitStatus {
    match s {
        "ready" => UnitStatus::Ready,
        "in_progress" => UnitStatus::InProgress,
        "blocked" => UnitStatus::Blocked,
        "pr_open" => UnitStatus::PrOpen,
        "in_review" => UnitStatus::InReview,
        "merging" => UnitStatus::Merging,
        "merged" => UnitStatus::Merged,
        "failed" => UnitStatus::Failed,
        _ => UnitStatus::Pending,
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: String,
    unit_id: String,
    task_number: i64,
    title: String,
    spec_path: String,
    depends_on: String,
    validation: String,
    status: String,
    agent_retries: i64,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Task {
        Task {
            id: Id::from_string(self.id),
            unit_id: Id::from_string(self.unit_id),
            task_number: self.task_number as u32,
            title: self.title,
            spec_path: self.spec_path,
            depends_on: serde_json::from_str(&self.depends_on).unwrap_or_default(),
            validation: self.validation,
            status: parse_task_status(&self.status),
            agent_retries: self.agent_retries as u32,
            error: self.error,
            created_at: from_ts(self.created_at),
            updated_at: from_ts(self.updated_at),
        }
    }
}

fn parse_task_status(s: &str) -> TaskStatus {
    match s {
        "in_progress" => TaskStatus::InProgress,
        "complete" => TaskStatus::Complete,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Pending,
    }
}

#[derive(FromRow)]
struct PullRequestRow {
    id: String,
    unit_id: String,
    number: i64,
    url: String,
    source_branch: String,
    target_branch: String,
    review_state: String,
    merge_strategy: String,
    merged: bool,
    merge_commit: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl PullRequestRow {
    fn into_pr(self) -> PullRequest {
        PullRequest {
            id: Id::from_string(self.id),
            unit_id: Id::from_string(self.unit_id),
            number: self.number as u64,
            url: self.url,
            source_branch: self.source_branch,
            target_branch: self.target_branch,
            review_state: parse_review_state(&self.review_state),
            merge_strategy: parse_merge_strategy(&self.merge_strategy),
            merged: self.merged,
            merge_commit: self.merge_commit,
            created_at: from_ts(self.created_at),
            updated_at: from_ts(self.updated_at),
        }
    }
}

fn parse_review_state(s: &str) -> ReviewState {
    match s {
        "in_progress" => ReviewState::InProgress,
        "changes_requested" => ReviewState::ChangesRequested,
        "approved" => ReviewState::Approved,
        _ => ReviewState::Pending,
    }
}

fn parse_merge_strategy(s: &str) -> MergeStrategy {
    match s {
        "merge" => MergeStrategy::Merge,
        "rebase" => MergeStrategy::Rebase,
        _ => MergeStrategy::Squash,
    }
}

#[derive(FromRow)]
struct EventRow {
    id: String,
    run_id: String,
    unit_id: Option<String>,
    sequence: i64,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            unit_id: self.unit_id.map(Id::from_string),
            sequence: self.sequence,
            event_type: self.event_type,
            timestamp: from_ts(self.ts),
            payload_json: self.payload_json,
        }
    }
}

#[derive(FromRow)]
struct GraphRow {
    run_id: String,
    nodes_json: String,
    edges_json: String,
    levels_json: String,
    created_at: i64,
}

impl GraphRow {
    fn into_snapshot(self) -> GraphSnapshot {
        GraphSnapshot {
            run_id: Id::from_string(self.run_id),
            nodes: serde_json::from_str(&self.nodes_json).unwrap_or_default(),
            edges: serde_json::from_str(&self.edges_json).unwrap_or_default(),
            levels: serde_json::from_str(&self.levels_json).unwrap_or_default(),
            created_at: from_ts(self.created_at),
        }
    }
}
