//! notes-forge: durable, rate-limited LLM note synthesis over lecture transcripts.
//!
//! The core is a SQLite-backed task queue driven in rounds by a bounded
//! worker pool, with a quality gate, automatic retries and two-stage
//! graceful shutdown. Transcript loading, the LLM call, scoring and output
//! are pluggable collaborators behind traits.

pub mod cli;
pub mod error;
pub mod llm;
pub mod quality;
pub mod scheduler;
pub mod storage;
pub mod transcripts;

// Re-export commonly used types
pub use error::{OrchestratorError, ProviderError, SinkError, SourceError, StoreError};
pub use scheduler::{
    Collaborators, Orchestrator, OrchestratorConfig, RunOutcome, ShutdownCoordinator, StopReason,
};
pub use storage::{RunSummary, Task, TaskStatus, TaskStore};
