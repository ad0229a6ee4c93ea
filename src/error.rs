//! Error types for notes-forge operations.
//!
//! One enum per subsystem:
//! - Task store persistence
//! - Synthesis provider calls
//! - Transcript loading and notes writing
//! - Orchestrated runs

use std::time::Duration;

use thiserror::Error;

use crate::storage::TaskStatus;

/// Errors raised by the durable task store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Task {id} is '{status}', expected 'processing'")]
    TaskNotInProcessing { id: i64, status: TaskStatus },

    #[error("Corrupt task row: {0}")]
    CorruptRow(String),
}

impl StoreError {
    /// Task-level guard violations. Everything else means the store itself
    /// is unusable and the run must stop.
    pub fn is_task_level(&self) -> bool {
        matches!(
            self,
            StoreError::TaskNotFound(_) | StoreError::TaskNotInProcessing { .. }
        )
    }
}

/// Errors returned by a synthesis provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider busy: {0}")]
    Busy(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Transient contention, retried by the rate limiter without consuming
    /// a task attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Busy(_))
    }
}

/// Errors raised while loading the input text for a task.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Source '{0}' is empty after cleaning")]
    Empty(String),
}

/// Errors raised while writing a finished artifact.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to write notes for '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Source path '{0}' has no parent directory or file stem")]
    InvalidSourcePath(String),
}

/// Errors that abort an orchestrated run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Task store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Worker task panicked: {0}")]
    WorkerPanicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_busy_is_transient() {
        assert!(ProviderError::Busy("overloaded".to_string()).is_transient());
        assert!(!ProviderError::Unavailable("down".to_string()).is_transient());
        assert!(!ProviderError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(!ProviderError::InvalidResponse("empty".to_string()).is_transient());
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::TaskNotFound(7).is_task_level());
        assert!(StoreError::TaskNotInProcessing {
            id: 7,
            status: TaskStatus::Completed
        }
        .is_task_level());
        assert!(!StoreError::CorruptRow("bad status".to_string()).is_task_level());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::TaskNotInProcessing {
            id: 3,
            status: TaskStatus::Pending,
        };
        assert!(err.to_string().contains("'pending'"));

        let err = ProviderError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }
}
