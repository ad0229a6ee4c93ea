//! Task store schema and row types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Default number of attempts a task gets before it is failed permanently.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub(crate) const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    source_locator  TEXT    NOT NULL UNIQUE,
    display_name    TEXT    NOT NULL,
    group_name      TEXT    NOT NULL,

    status          TEXT    NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL DEFAULT 3,

    -- Outcome
    quality_score   REAL,
    tokens_used     INTEGER,
    model_used      TEXT,
    error_message   TEXT,

    -- Timestamps (fixed-width UTC text, comparable lexicographically)
    created_at      TEXT    NOT NULL,
    claimed_at      TEXT,
    completed_at    TEXT,
    updated_at      TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, id);

CREATE TABLE IF NOT EXISTS rounds (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    round           INTEGER NOT NULL,
    started_at      TEXT    NOT NULL,
    claimed         INTEGER NOT NULL,
    completed       INTEGER NOT NULL,
    requeued        INTEGER NOT NULL,
    failed          INTEGER NOT NULL,
    released        INTEGER NOT NULL,
    average_quality REAL,
    elapsed_ms      INTEGER NOT NULL
);
"#;

/// Lifecycle state of a task.
///
/// Transitions: `pending -> processing -> {completed | pending | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// No further transitions happen without an administrative reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(StoreError::CorruptRow(format!("unknown status '{}'", other))),
        }
    }
}

/// One unit of work: a single input item awaiting synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub source_locator: String,
    pub display_name: String,
    pub group_name: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub quality_score: Option<f64>,
    pub tokens_used: Option<i64>,
    pub model_used: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// `Pending` when the task will be retried, `Failed` when exhausted.
    pub status: TaskStatus,
    pub attempts: u32,
}

impl AttemptOutcome {
    pub fn is_exhausted(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

/// Aggregate snapshot of the store, recomputed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Mean quality over completed tasks.
    pub average_quality: Option<f64>,
    pub total_tokens: u64,
}

impl RunSummary {
    /// Percentage of `count` relative to the total, 0 when the store is empty.
    pub fn percent(&self, count: u64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (count as f64 / self.total as f64) * 100.0
    }

    pub fn has_open_work(&self) -> bool {
        self.pending > 0 || self.processing > 0
    }
}

/// Aggregated outcome of one orchestrator round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundReport {
    pub round: u32,
    pub started_at: DateTime<Utc>,
    pub claimed: u64,
    pub completed: u64,
    /// Failed attempts that went back to `pending`.
    pub requeued: u64,
    /// Failed attempts that exhausted the budget.
    pub failed: u64,
    /// Claimed tasks handed back unstarted because of a drain.
    pub released: u64,
    pub average_quality: Option<f64>,
    pub elapsed: Duration,
}

impl RoundReport {
    /// Tasks that reached a write-back this round.
    pub fn settled(&self) -> u64 {
        self.completed + self.requeued + self.failed + self.released
    }
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow(format!("bad timestamp '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_and_display() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn test_timestamps_are_fixed_width_and_ordered() {
        let early = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = early + chrono::Duration::milliseconds(1500);

        let a = format_timestamp(early);
        let b = format_timestamp(late);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_timestamp(&b).unwrap(), late);
    }

    #[test]
    fn test_summary_percent() {
        let summary = RunSummary {
            total: 8,
            completed: 2,
            ..Default::default()
        };
        assert!((summary.percent(summary.completed) - 25.0).abs() < f64::EPSILON);
        assert_eq!(RunSummary::default().percent(0), 0.0);
    }
}
