//! SQLite persistent task store.
//!
//! This module provides the durable record of every unit of work and its
//! lifecycle state.
//!
//! # Overview
//!
//! - **TaskStore**: atomic operations over the `tasks` table (enqueue, claim,
//!   complete, fail, administrative resets, statistics)
//! - **Schema**: table definitions and the row types they map to
//!
//! # Usage
//!
//! ```rust,ignore
//! use notes_forge::storage::TaskStore;
//!
//! let store = TaskStore::open("synthesis_tasks.db").await?;
//! store.enqueue("/courses/rust/01-intro.srt", "01-intro", "rust").await?;
//!
//! let batch = store.claim_batch(10).await?;
//! for task in batch {
//!     store.complete(task.id, 0.86, Some(1_200), "sonnet").await?;
//! }
//!
//! let summary = store.statistics().await?;
//! ```

pub mod schema;
pub mod task_store;

pub use schema::{
    AttemptOutcome, RoundReport, RunSummary, Task, TaskStatus, DEFAULT_MAX_ATTEMPTS,
};
pub use task_store::TaskStore;
