//! Round-based orchestration over the task store.
//!
//! ```text
//! Idle -> ClaimingBatch -> Dispatching -> AwaitingWorkers -> Reporting
//!              ^                                                 |
//!              +-------------------------------------------------+
//!              |
//!              +-> Finished   (empty claim, drain or force)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::config::{ConfigError, OrchestratorConfig};
use super::rate_limiter::RateLimiter;
use super::shutdown::ShutdownHandle;
use super::worker::{Worker, WorkerContext, WorkerReport};
use crate::error::{OrchestratorError, StoreError};
use crate::llm::{PersonaConfig, SynthesisProvider};
use crate::quality::QualityEvaluator;
use crate::storage::{RoundReport, Task, TaskStore};
use crate::transcripts::{NotesSink, TranscriptSource};

/// Orchestrator state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    ClaimingBatch,
    Dispatching,
    AwaitingWorkers,
    Reporting,
    Finished,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::ClaimingBatch => "claiming_batch",
            OrchestratorState::Dispatching => "dispatching",
            OrchestratorState::AwaitingWorkers => "awaiting_workers",
            OrchestratorState::Reporting => "reporting",
            OrchestratorState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No pending work was left to claim.
    Exhausted,
    /// A drain was requested; the last round finished cooperatively.
    Drained,
    /// A forced shutdown abandoned the current round.
    Forced,
}

/// Result of [`Orchestrator::run`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub rounds: Vec<RoundReport>,
    pub stop: StopReason,
    /// Dangling `processing` rows swept back to `pending` at startup.
    pub reconciled: u64,
}

impl RunOutcome {
    pub fn total_completed(&self) -> u64 {
        self.rounds.iter().map(|r| r.completed).sum()
    }
}

/// The external collaborators a run is composed from.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn SynthesisProvider>,
    pub evaluator: Arc<dyn QualityEvaluator>,
    pub source: Arc<dyn TranscriptSource>,
    pub sink: Arc<dyn NotesSink>,
    pub persona: PersonaConfig,
}

/// Drives rounds of claim, fan-out and report until the store runs dry or
/// shutdown is requested.
pub struct Orchestrator {
    config: OrchestratorConfig,
    ctx: Arc<WorkerContext>,
    state: OrchestratorState,
}

impl Orchestrator {
    /// Builds an orchestrator over `store`. The store adopts
    /// `config.max_attempts` as its attempt budget.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration does not validate.
    pub fn new(
        config: OrchestratorConfig,
        store: TaskStore,
        collaborators: Collaborators,
        shutdown: ShutdownHandle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let limiter = RateLimiter::new(
            config.max_concurrent_calls,
            config.jitter.clone(),
            config.busy_backoff.clone(),
        );
        let ctx = WorkerContext {
            store: store.with_default_max_attempts(config.max_attempts),
            limiter,
            provider: collaborators.provider,
            evaluator: collaborators.evaluator,
            source: collaborators.source,
            sink: collaborators.sink,
            persona: Arc::new(collaborators.persona),
            shutdown,
            quality_threshold: config.quality_threshold,
            max_input_chars: config.max_input_chars,
            inter_task_delay: config.inter_task_delay,
        };

        Ok(Self {
            config,
            ctx: Arc::new(ctx),
            state: OrchestratorState::Idle,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// The validated configuration this orchestrator runs with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Shared provider gate, exposed for progress reporting.
    pub fn limiter(&self) -> &RateLimiter {
        &self.ctx.limiter
    }

    /// Runs rounds until there is nothing left to claim or shutdown is
    /// requested.
    ///
    /// # Errors
    ///
    /// Only task-store failures and worker panics abort a run. Per-task
    /// failures are recorded on the tasks themselves.
    pub async fn run(&mut self) -> Result<RunOutcome, OrchestratorError> {
        let reconciled = self.ctx.store.reset_stuck(self.config.stuck_task_age).await?;
        if reconciled > 0 {
            warn!(reconciled, "Returned tasks left processing by a previous run to pending");
        }
        self.ctx.store.apply_attempt_budget().await?;

        info!(
            workers = self.config.workers,
            batch_size = self.config.batch_size,
            max_concurrent_calls = self.config.max_concurrent_calls,
            threshold = self.config.quality_threshold,
            "Starting orchestrated run"
        );

        let mut rounds = Vec::new();
        let stop = loop {
            if let Some(reason) = self.shutdown_requested() {
                break reason;
            }

            self.transition(OrchestratorState::ClaimingBatch);
            let batch = self.ctx.store.claim_batch(self.config.round_capacity()).await?;
            if batch.is_empty() {
                break StopReason::Exhausted;
            }

            let round = rounds.len() as u32 + 1;
            match self.run_round(round, batch).await? {
                Some(report) => rounds.push(report),
                None => break StopReason::Forced,
            }
        };

        self.transition(OrchestratorState::Finished);
        info!(rounds = rounds.len(), stop = ?stop, "Run finished");
        Ok(RunOutcome {
            rounds,
            stop,
            reconciled,
        })
    }

    /// One claimed batch, start to finish. `None` when a forced shutdown
    /// abandoned the round.
    async fn run_round(
        &mut self,
        round: u32,
        batch: Vec<Task>,
    ) -> Result<Option<RoundReport>, OrchestratorError> {
        let started_at = Utc::now();
        let start_time = Instant::now();
        let claimed = batch.len() as u64;
        info!(round, claimed, "Round started");

        self.transition(OrchestratorState::Dispatching);
        let mut workers = JoinSet::new();
        for (index, slice) in partition(batch, self.config.workers).into_iter().enumerate() {
            if slice.is_empty() {
                continue;
            }
            let worker = Worker::new(index + 1, Arc::clone(&self.ctx));
            workers.spawn(worker.run(slice));
        }

        self.transition(OrchestratorState::AwaitingWorkers);
        let Some(reports) = self.await_workers(&mut workers).await? else {
            warn!(round, "Forced shutdown: abandoning in-flight tasks");
            return Ok(None);
        };

        self.transition(OrchestratorState::Reporting);
        let report = aggregate(round, started_at, claimed, &reports, start_time.elapsed());
        info!(
            round,
            claimed = report.claimed,
            completed = report.completed,
            requeued = report.requeued,
            failed = report.failed,
            released = report.released,
            average_quality = report.average_quality,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Round finished"
        );
        self.ctx.store.record_round(&report).await?;
        Ok(Some(report))
    }

    async fn await_workers(
        &self,
        workers: &mut JoinSet<Result<WorkerReport, StoreError>>,
    ) -> Result<Option<Vec<WorkerReport>>, OrchestratorError> {
        let mut reports = Vec::with_capacity(workers.len());
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.forced() => {
                    workers.abort_all();
                    return Ok(None);
                }
                joined = workers.join_next() => match joined {
                    None => return Ok(Some(reports)),
                    Some(Ok(Ok(report))) => reports.push(report),
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Worker stopped on task store failure");
                        workers.abort_all();
                        return Err(e.into());
                    }
                    Some(Err(e)) if e.is_panic() => {
                        workers.abort_all();
                        return Err(OrchestratorError::WorkerPanicked(e.to_string()));
                    }
                    Some(Err(e)) => debug!(error = %e, "Worker cancelled"),
                },
            }
        }
    }

    fn shutdown_requested(&self) -> Option<StopReason> {
        if self.ctx.shutdown.is_forced() {
            Some(StopReason::Forced)
        } else if self.ctx.shutdown.is_draining() {
            Some(StopReason::Drained)
        } else {
            None
        }
    }

    fn transition(&mut self, next: OrchestratorState) {
        debug!(from = %self.state, to = %next, "Orchestrator state");
        self.state = next;
    }
}

/// Round-robin split into `workers` slices, preserving claim order within
/// each slice.
fn partition(batch: Vec<Task>, workers: usize) -> Vec<Vec<Task>> {
    let workers = workers.max(1);
    let mut slices: Vec<Vec<Task>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, task) in batch.into_iter().enumerate() {
        slices[i % workers].push(task);
    }
    slices
}

fn aggregate(
    round: u32,
    started_at: chrono::DateTime<Utc>,
    claimed: u64,
    reports: &[WorkerReport],
    elapsed: std::time::Duration,
) -> RoundReport {
    let mut report = RoundReport {
        round,
        started_at,
        claimed,
        completed: 0,
        requeued: 0,
        failed: 0,
        released: 0,
        average_quality: None,
        elapsed,
    };
    let mut quality_sum = 0.0;
    for r in reports {
        report.completed += r.completed;
        report.requeued += r.requeued;
        report.failed += r.failed;
        report.released += r.released;
        quality_sum += r.quality_sum;
    }
    if report.completed > 0 {
        report.average_quality = Some(quality_sum / report.completed as f64);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TaskStatus;

    fn task(id: i64) -> Task {
        Task {
            id,
            source_locator: format!("/in/{id}.srt"),
            display_name: id.to_string(),
            group_name: "g".to_string(),
            status: TaskStatus::Processing,
            attempts: 0,
            max_attempts: 3,
            quality_score: None,
            tokens_used: None,
            model_used: None,
            error_message: None,
            created_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_partition_round_robin() {
        let batch = (1..=7).map(task).collect();
        let slices = partition(batch, 3);
        let ids: Vec<Vec<i64>> = slices
            .iter()
            .map(|s| s.iter().map(|t| t.id).collect())
            .collect();
        assert_eq!(ids, vec![vec![1, 4, 7], vec![2, 5], vec![3, 6]]);
    }

    #[test]
    fn test_partition_more_workers_than_tasks() {
        let slices = partition(vec![task(1)], 4);
        assert_eq!(slices.len(), 4);
        assert_eq!(slices.iter().filter(|s| !s.is_empty()).count(), 1);
    }

    #[test]
    fn test_aggregate_reports() {
        let reports = vec![
            WorkerReport {
                worker_id: 1,
                completed: 2,
                requeued: 1,
                quality_sum: 1.6,
                ..Default::default()
            },
            WorkerReport {
                worker_id: 2,
                completed: 2,
                failed: 1,
                released: 3,
                quality_sum: 2.0,
                ..Default::default()
            },
        ];
        let report = aggregate(1, Utc::now(), 9, &reports, std::time::Duration::ZERO);
        assert_eq!(report.completed, 4);
        assert_eq!(report.settled(), 9);
        assert!((report.average_quality.unwrap() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(OrchestratorState::AwaitingWorkers.to_string(), "awaiting_workers");
    }
}
