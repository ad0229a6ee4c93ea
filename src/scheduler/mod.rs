//! Orchestration core: a bounded worker pool driven in rounds over the
//! durable task store.
//!
//! - **Orchestrator**: claims `workers x batch_size` pending tasks per round,
//!   fans them out round-robin, awaits the workers and records a report
//! - **Worker**: processes its slice sequentially, one provider call at a time
//! - **RateLimiter**: caps provider calls across all workers, with jitter and
//!   busy-retry backoff
//! - **ShutdownCoordinator**: first interrupt drains, second forces
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use notes_forge::scheduler::{Collaborators, Orchestrator, OrchestratorConfig, ShutdownCoordinator};
//!
//! let shutdown = ShutdownCoordinator::new();
//! shutdown.listen_for_signals();
//!
//! let mut orchestrator = Orchestrator::new(
//!     OrchestratorConfig::from_env()?,
//!     store,
//!     collaborators,
//!     shutdown.handle(),
//! )?;
//! let outcome = orchestrator.run().await?;
//! println!("{} rounds, stopped: {:?}", outcome.rounds.len(), outcome.stop);
//! ```

pub mod config;
pub mod orchestrator;
pub mod rate_limiter;
pub mod shutdown;
pub mod worker;

pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorState, RunOutcome, StopReason};
pub use rate_limiter::{BackoffPolicy, RateLimiter, RatePermit};
pub use shutdown::{ExitGuard, ShutdownCoordinator, ShutdownHandle, ShutdownLevel};
pub use worker::{Worker, WorkerContext, WorkerReport};
