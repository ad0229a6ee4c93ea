//! A worker drains its slice of claimed tasks, one provider call at a time.
//!
//! Every task it starts reaches a write-back (`complete` or `fail_attempt`).
//! Tasks it never starts because of a drain are released back to `pending`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::rate_limiter::RateLimiter;
use super::shutdown::ShutdownHandle;
use crate::error::{ProviderError, SinkError, SourceError, StoreError};
use crate::llm::{PersonaConfig, Synthesis, SynthesisInput, SynthesisProvider};
use crate::quality::QualityEvaluator;
use crate::storage::{AttemptOutcome, Task, TaskStore};
use crate::transcripts::{NotesSink, TranscriptSource};

/// Everything a worker needs, shared by all workers of a run.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: TaskStore,
    pub limiter: RateLimiter,
    pub provider: Arc<dyn SynthesisProvider>,
    pub evaluator: Arc<dyn QualityEvaluator>,
    pub source: Arc<dyn TranscriptSource>,
    pub sink: Arc<dyn NotesSink>,
    pub persona: Arc<PersonaConfig>,
    pub shutdown: ShutdownHandle,
    pub quality_threshold: f64,
    pub max_input_chars: usize,
    pub inter_task_delay: Duration,
}

/// Per-worker tallies for one round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub completed: u64,
    pub requeued: u64,
    pub failed: u64,
    pub released: u64,
    /// Sum of quality scores over completed tasks.
    pub quality_sum: f64,
}

impl WorkerReport {
    fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }
}

/// Why one attempt at a task did not produce accepted notes.
#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Too large ({chars} chars, limit {limit})")]
    TooLarge { chars: usize, limit: usize },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Quality below threshold ({score:.2} < {threshold:.2}): {issues}")]
    LowQuality {
        score: f64,
        threshold: f64,
        issues: String,
    },

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// A synthesis that passed the quality gate and has been written out.
struct Accepted {
    synthesis: Synthesis,
    quality: f64,
    path: PathBuf,
}

/// Processes one slice of a round's batch, one task at a time.
pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    /// Creates a worker. `id` only tags log lines and the report.
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self { id, ctx }
    }

    /// Processes `tasks` in order. Returns `Err` only when the store itself
    /// fails; per-task problems are recorded on the task.
    pub async fn run(self, tasks: Vec<Task>) -> Result<WorkerReport, StoreError> {
        let mut report = WorkerReport::new(self.id);
        info!(worker_id = self.id, tasks = tasks.len(), "Worker started");

        let mut queue = tasks.into_iter();
        while let Some(task) = queue.next() {
            if self.ctx.shutdown.is_draining() {
                let ids: Vec<i64> = std::iter::once(task.id)
                    .chain(queue.by_ref().map(|t| t.id))
                    .collect();
                report.released += self.ctx.store.release(&ids).await?;
                info!(
                    worker_id = self.id,
                    released = report.released,
                    "Drain requested, released unstarted tasks"
                );
                break;
            }

            self.process(&task, &mut report).await?;

            if queue.len() > 0 && !self.ctx.inter_task_delay.is_zero() {
                tokio::time::sleep(self.ctx.inter_task_delay).await;
            }
        }

        info!(
            worker_id = self.id,
            completed = report.completed,
            requeued = report.requeued,
            failed = report.failed,
            released = report.released,
            "Worker stopped"
        );
        Ok(report)
    }

    async fn process(&self, task: &Task, report: &mut WorkerReport) -> Result<(), StoreError> {
        let start_time = Instant::now();
        debug!(
            worker_id = self.id,
            task_id = task.id,
            lecture = %task.display_name,
            attempt = task.attempts + 1,
            "Processing task"
        );

        match self.attempt(task).await {
            Ok(accepted) => {
                let written = self
                    .ctx
                    .store
                    .complete(
                        task.id,
                        accepted.quality,
                        accepted.synthesis.tokens_used,
                        &accepted.synthesis.model,
                    )
                    .await;
                match written {
                    Ok(()) => {
                        report.completed += 1;
                        report.quality_sum += accepted.quality;
                        info!(
                            worker_id = self.id,
                            task_id = task.id,
                            lecture = %task.display_name,
                            quality = accepted.quality,
                            tokens = accepted.synthesis.tokens_used,
                            path = %accepted.path.display(),
                            duration_ms = start_time.elapsed().as_millis() as u64,
                            "Task completed"
                        );
                    }
                    Err(e) if e.is_task_level() => {
                        warn!(worker_id = self.id, task_id = task.id, error = %e, "Completion rejected");
                    }
                    Err(e) => {
                        error!(worker_id = self.id, task_id = task.id, error = %e, "Task store failure");
                        return Err(e);
                    }
                }
            }
            Err(reason) => {
                let message = reason.to_string();
                match self.ctx.store.fail_attempt(task.id, &message).await {
                    Ok(outcome) => self.record_failure(task, outcome, &message, report),
                    Err(e) if e.is_task_level() => {
                        warn!(worker_id = self.id, task_id = task.id, error = %e, "Failure write-back rejected");
                    }
                    Err(e) => {
                        error!(worker_id = self.id, task_id = task.id, error = %e, "Task store failure");
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn attempt(&self, task: &Task) -> Result<Accepted, AttemptError> {
        let text = self.ctx.source.load(task).await?;

        let chars = text.chars().count();
        if chars > self.ctx.max_input_chars {
            return Err(AttemptError::TooLarge {
                chars,
                limit: self.ctx.max_input_chars,
            });
        }

        let input = SynthesisInput {
            display_name: task.display_name.clone(),
            group_name: task.group_name.clone(),
            text,
        };
        let synthesis = self
            .ctx
            .limiter
            .call(|| self.ctx.provider.generate(&self.ctx.persona, &input))
            .await?;

        let quality = self
            .ctx
            .evaluator
            .evaluate(&synthesis.text, &task.display_name);
        if !quality.passes(self.ctx.quality_threshold) {
            return Err(AttemptError::LowQuality {
                score: quality.score,
                threshold: self.ctx.quality_threshold,
                issues: quality.summary(),
            });
        }

        let path = self.ctx.sink.persist(task, &synthesis.text).await?;
        Ok(Accepted {
            quality: quality.score,
            synthesis,
            path,
        })
    }

    fn record_failure(
        &self,
        task: &Task,
        outcome: AttemptOutcome,
        message: &str,
        report: &mut WorkerReport,
    ) {
        if outcome.is_exhausted() {
            report.failed += 1;
            error!(
                worker_id = self.id,
                task_id = task.id,
                lecture = %task.display_name,
                attempts = outcome.attempts,
                error = message,
                "Task failed permanently"
            );
        } else {
            report.requeued += 1;
            warn!(
                worker_id = self.id,
                task_id = task.id,
                lecture = %task.display_name,
                attempts = outcome.attempts,
                error = message,
                "Task attempt failed, will retry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityReport;
    use crate::scheduler::{BackoffPolicy, ShutdownCoordinator};
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct EchoProvider;

    #[async_trait]
    impl SynthesisProvider for EchoProvider {
        async fn generate(
            &self,
            persona: &PersonaConfig,
            input: &SynthesisInput,
        ) -> Result<Synthesis, ProviderError> {
            Ok(Synthesis {
                text: input.text.clone(),
                tokens_used: None,
                model: persona.model.clone(),
            })
        }
    }

    struct FixedScore(f64);

    impl QualityEvaluator for FixedScore {
        fn evaluate(&self, _text: &str, _display_name: &str) -> QualityReport {
            QualityReport {
                score: self.0,
                issues: Vec::new(),
            }
        }
    }

    /// Fails to load every task whose name starts with "missing".
    struct NamedSource;

    #[async_trait]
    impl TranscriptSource for NamedSource {
        async fn load(&self, task: &Task) -> Result<String, SourceError> {
            if task.display_name.starts_with("missing") {
                return Err(SourceError::Empty(task.source_locator.clone()));
            }
            Ok(format!("transcript of {}", task.display_name))
        }
    }

    struct NullSink;

    #[async_trait]
    impl NotesSink for NullSink {
        async fn persist(&self, task: &Task, _text: &str) -> Result<PathBuf, SinkError> {
            Ok(PathBuf::from(&task.source_locator))
        }
    }

    fn context(store: TaskStore, shutdown: &ShutdownCoordinator) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            store,
            limiter: RateLimiter::new(
                1,
                Duration::ZERO..=Duration::ZERO,
                BackoffPolicy::immediate(0),
            ),
            provider: Arc::new(EchoProvider),
            evaluator: Arc::new(FixedScore(0.8)),
            source: Arc::new(NamedSource),
            sink: Arc::new(NullSink),
            persona: Arc::new(PersonaConfig::default()),
            shutdown: shutdown.handle(),
            quality_threshold: 0.7,
            max_input_chars: 10_000,
            inter_task_delay: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_worker_settles_every_task() {
        let dir = tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.db")).await.unwrap();
        for name in ["a", "missing-b", "c"] {
            store
                .enqueue(&format!("/in/{name}.srt"), name, "g")
                .await
                .unwrap();
        }
        let shutdown = ShutdownCoordinator::new();
        let ctx = context(store.clone(), &shutdown);

        let tasks = store.claim_batch(10).await.unwrap();
        let report = Worker::new(1, ctx).run(tasks).await.unwrap();

        assert_eq!(report.completed, 2);
        assert_eq!(report.requeued, 1);
        assert!((report.quality_sum - 1.6).abs() < 1e-9);

        let missing = store.get(2).await.unwrap().unwrap();
        assert_eq!(missing.status, crate::storage::TaskStatus::Pending);
        assert_eq!(missing.attempts, 1);
        assert!(missing.error_message.unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn test_draining_worker_releases_unstarted_tasks() {
        let dir = tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.db")).await.unwrap();
        for i in 0..3 {
            store.enqueue(&format!("/in/{i}.srt"), "x", "g").await.unwrap();
        }
        let shutdown = ShutdownCoordinator::new();
        shutdown.escalate();
        let ctx = context(store.clone(), &shutdown);

        let tasks = store.claim_batch(10).await.unwrap();
        let report = Worker::new(1, ctx).run(tasks).await.unwrap();

        assert_eq!(report.released, 3);
        assert_eq!(report.completed, 0);
        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 0);
    }
}
