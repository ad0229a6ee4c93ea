//! SQLite-backed task store.
//!
//! Every state transition is a single SQL statement (or one transaction), so
//! concurrent callers in the same process never observe or produce a torn
//! task. `claim_batch` is the exclusivity point: a pending row is flipped to
//! `processing` by exactly one caller.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::schema::{
    format_timestamp, parse_timestamp, AttemptOutcome, RoundReport, RunSummary, Task, TaskStatus,
    DEFAULT_MAX_ATTEMPTS, SCHEMA_SQL,
};
use crate::error::StoreError;

const TASK_COLUMNS: &str = "id, source_locator, display_name, group_name, status, attempts, \
     max_attempts, quality_score, tokens_used, model_used, error_message, created_at, \
     claimed_at, completed_at";

/// Durable record of every task and its state.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    default_max_attempts: u32,
}

impl TaskStore {
    /// Opens (creating if missing) the store at `path` and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        info!(path = %path.display(), "Task store opened");
        Ok(Self {
            pool,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Sets the attempt budget given to newly enqueued (and re-opened) tasks.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Attempt budget given to newly enqueued tasks.
    pub fn default_max_attempts(&self) -> u32 {
        self.default_max_attempts
    }

    /// Inserts a pending task. A duplicate `source_locator` is a no-op.
    ///
    /// Returns `true` when a new row was created.
    pub async fn enqueue(
        &self,
        source_locator: &str,
        display_name: &str,
        group_name: &str,
    ) -> Result<bool, StoreError> {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "INSERT INTO tasks (
                source_locator, display_name, group_name, status, attempts, max_attempts,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5)
            ON CONFLICT(source_locator) DO NOTHING",
        )
        .bind(source_locator)
        .bind(display_name)
        .bind(group_name)
        .bind(self.default_max_attempts as i64)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            debug!(source_locator, "Duplicate enqueue skipped");
        }
        Ok(inserted)
    }

    /// Atomically claims up to `limit` pending tasks in insertion order.
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = format_timestamp(Utc::now());
        let sql = format!(
            "UPDATE tasks
             SET status = 'processing', claimed_at = ?1, updated_at = ?1
             WHERE id IN (
                 SELECT id FROM tasks WHERE status = 'pending' ORDER BY id LIMIT ?2
             )
             RETURNING {}",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified.
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    /// Marks a processing task completed, consuming the successful attempt.
    pub async fn complete(
        &self,
        id: i64,
        quality_score: f64,
        tokens_used: Option<i64>,
        model: &str,
    ) -> Result<(), StoreError> {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'completed', attempts = attempts + 1, quality_score = ?2,
                 tokens_used = ?3, model_used = ?4, error_message = NULL,
                 claimed_at = NULL, completed_at = ?5, updated_at = ?5
             WHERE id = ?1 AND status = 'processing'",
        )
        .bind(id)
        .bind(quality_score.clamp(0.0, 1.0))
        .bind(tokens_used)
        .bind(model)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_in_processing(id).await);
        }
        Ok(())
    }

    /// Records a failed attempt on a processing task: back to `pending` while
    /// budget remains, `failed` once `attempts` reaches `max_attempts`.
    pub async fn fail_attempt(
        &self,
        id: i64,
        error_message: &str,
    ) -> Result<AttemptOutcome, StoreError> {
        let now = format_timestamp(Utc::now());
        let row = sqlx::query(
            "UPDATE tasks
             SET attempts = attempts + 1,
                 status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                 error_message = ?2, claimed_at = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'processing'
             RETURNING status, attempts",
        )
        .bind(id)
        .bind(error_message)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(AttemptOutcome {
                status: row.try_get::<String, _>("status")?.parse()?,
                attempts: row.try_get::<i64, _>("attempts")? as u32,
            }),
            None => Err(self.not_in_processing(id).await),
        }
    }

    /// Hands claimed-but-unstarted tasks back to `pending` without consuming
    /// an attempt. Rows no longer in `processing` are left alone.
    pub async fn release(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut released = 0;
        for &id in ids {
            let result = sqlx::query(
                "UPDATE tasks SET status = 'pending', claimed_at = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'processing'",
            )
            .bind(id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            released += result.rows_affected();
        }
        tx.commit().await?;
        Ok(released)
    }

    /// Re-opens permanently failed tasks with a fresh attempt budget.
    ///
    /// `attempts` is never rewound; `max_attempts` is raised instead.
    pub async fn reset_failed(&self) -> Result<u64, StoreError> {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'pending', max_attempts = attempts + ?1, updated_at = ?2
             WHERE status = 'failed'",
        )
        .bind(self.default_max_attempts as i64)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        info!(count, "Failed tasks reset to pending");
        Ok(count)
    }

    /// Gives every pending task that has never been attempted the store's
    /// current attempt budget. Tasks with attempts on record keep theirs.
    pub async fn apply_attempt_budget(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET max_attempts = ?1, updated_at = ?2
             WHERE status = 'pending' AND attempts = 0 AND max_attempts != ?1",
        )
        .bind(self.default_max_attempts as i64)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!(
                count,
                max_attempts = self.default_max_attempts,
                "Attempt budget applied to untouched pending tasks"
            );
        }
        Ok(count)
    }

    /// Returns tasks claimed at least `age` ago and still `processing` to
    /// `pending`. These are leftovers of a forced shutdown.
    pub async fn reset_stuck(&self, age: Duration) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', claimed_at = NULL, updated_at = ?2
             WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at <= ?1)",
        )
        .bind(format_timestamp(cutoff))
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!(count, age_secs = age.as_secs(), "Stuck tasks reset to pending");
        }
        Ok(count)
    }

    /// Read-only aggregate snapshot.
    pub async fn statistics(&self) -> Result<RunSummary, StoreError> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                AVG(CASE WHEN status = 'completed' THEN quality_score END) AS average_quality,
                COALESCE(SUM(tokens_used), 0) AS total_tokens
             FROM tasks",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(RunSummary {
            total: row.try_get::<i64, _>("total")? as u64,
            pending: row.try_get::<i64, _>("pending")? as u64,
            processing: row.try_get::<i64, _>("processing")? as u64,
            completed: row.try_get::<i64, _>("completed")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            average_quality: row.try_get("average_quality")?,
            total_tokens: row.try_get::<i64, _>("total_tokens")? as u64,
        })
    }

    /// Looks a task up by its row id.
    pub async fn get(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Looks a task up by the transcript it was enqueued for.
    pub async fn find_by_locator(&self, source_locator: &str) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {} FROM tasks WHERE source_locator = ?1", TASK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(source_locator)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Permanently failed tasks, ordered by display name.
    pub async fn list_failed(&self) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'failed' ORDER BY display_name, id",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Deletes every task and the round history. Administrative reset only.
    pub async fn purge(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM tasks")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM rounds").execute(&mut *tx).await?;
        tx.commit().await?;

        info!(deleted, "Task store purged");
        Ok(deleted)
    }

    /// Appends a round report to the history table.
    pub async fn record_round(&self, report: &RoundReport) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO rounds (
                round, started_at, claimed, completed, requeued, failed, released,
                average_quality, elapsed_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(report.round as i64)
        .bind(format_timestamp(report.started_at))
        .bind(report.claimed as i64)
        .bind(report.completed as i64)
        .bind(report.requeued as i64)
        .bind(report.failed as i64)
        .bind(report.released as i64)
        .bind(report.average_quality)
        .bind(report.elapsed.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent round reports, newest first.
    pub async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundReport>, StoreError> {
        let rows = sqlx::query(
            "SELECT round, started_at, claimed, completed, requeued, failed, released,
                    average_quality, elapsed_ms
             FROM rounds ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RoundReport, StoreError> {
                Ok(RoundReport {
                    round: row.try_get::<i64, _>("round")? as u32,
                    started_at: parse_timestamp(&row.try_get::<String, _>("started_at")?)?,
                    claimed: row.try_get::<i64, _>("claimed")? as u64,
                    completed: row.try_get::<i64, _>("completed")? as u64,
                    requeued: row.try_get::<i64, _>("requeued")? as u64,
                    failed: row.try_get::<i64, _>("failed")? as u64,
                    released: row.try_get::<i64, _>("released")? as u64,
                    average_quality: row.try_get("average_quality")?,
                    elapsed: Duration::from_millis(row.try_get::<i64, _>("elapsed_ms")? as u64),
                })
            })
            .collect()
    }

    /// Builds the guard error for a write that matched no processing row.
    async fn not_in_processing(&self, id: i64) -> StoreError {
        let status = sqlx::query("SELECT status FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await;

        match status {
            Ok(Some(row)) => match row
                .try_get::<String, _>("status")
                .map_err(StoreError::from)
                .and_then(|s| s.parse::<TaskStatus>())
            {
                Ok(status) => StoreError::TaskNotInProcessing { id, status },
                Err(e) => e,
            },
            Ok(None) => StoreError::TaskNotFound(id),
            Err(e) => StoreError::Database(e),
        }
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let optional_timestamp = |column: &str| -> Result<Option<DateTime<Utc>>, StoreError> {
        row.try_get::<Option<String>, _>(column)?
            .as_deref()
            .map(parse_timestamp)
            .transpose()
    };

    Ok(Task {
        id: row.try_get("id")?,
        source_locator: row.try_get("source_locator")?,
        display_name: row.try_get("display_name")?,
        group_name: row.try_get("group_name")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
        quality_score: row.try_get("quality_score")?,
        tokens_used: row.try_get("tokens_used")?,
        model_used: row.try_get("model_used")?,
        error_message: row.try_get("error_message")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        claimed_at: optional_timestamp("claimed_at")?,
        completed_at: optional_timestamp("completed_at")?,
    })
}
