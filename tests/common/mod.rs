//! In-process fakes for driving the orchestrator without a network or files.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use notes_forge::error::{ProviderError, SinkError, SourceError};
use notes_forge::llm::{PersonaConfig, Synthesis, SynthesisInput, SynthesisProvider};
use notes_forge::quality::{QualityEvaluator, QualityReport};
use notes_forge::scheduler::{BackoffPolicy, Collaborators, OrchestratorConfig};
use notes_forge::storage::{Task, TaskStore};
use notes_forge::transcripts::{NotesSink, TranscriptSource};

/// Provider whose output encodes a score the [`ScoreEvaluator`] reads back.
///
/// The n-th call for a given lecture returns `scores[n]` (the last entry
/// repeats). Tracks how many calls overlap.
#[derive(Default)]
pub struct ScriptedProvider {
    scores: Vec<f64>,
    delay: Duration,
    busy_responses: AtomicUsize,
    calls_by_lecture: Mutex<HashMap<String, usize>>,
    pub total_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn scoring(scores: &[f64]) -> Self {
        Self {
            scores: scores.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The first `n` calls (across all lectures) answer `Busy`.
    pub fn with_busy_responses(self, n: usize) -> Self {
        self.busy_responses.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn max_overlap(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisProvider for ScriptedProvider {
    async fn generate(
        &self,
        persona: &PersonaConfig,
        input: &SynthesisInput,
    ) -> Result<Synthesis, ProviderError> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let busy = self
            .busy_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            return Err(ProviderError::Busy("overloaded".to_string()));
        }

        let call = {
            let mut calls = self.calls_by_lecture.lock().unwrap();
            let n = calls.entry(input.display_name.clone()).or_insert(0);
            *n += 1;
            *n - 1
        };
        let score = self
            .scores
            .get(call)
            .or(self.scores.last())
            .copied()
            .unwrap_or(1.0);

        Ok(Synthesis {
            text: format!("score={score}\n## Notes for {}", input.display_name),
            tokens_used: Some(100),
            model: persona.model.clone(),
        })
    }
}

/// Reads the `score=` line the scripted provider writes.
pub struct ScoreEvaluator;

impl QualityEvaluator for ScoreEvaluator {
    fn evaluate(&self, text: &str, _display_name: &str) -> QualityReport {
        let score = text
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("score="))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        QualityReport {
            score,
            issues: Vec::new(),
        }
    }
}

/// Serves a fixed-size transcript for every task.
pub struct MemorySource {
    pub chars: usize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self { chars: 200 }
    }
}

#[async_trait]
impl TranscriptSource for MemorySource {
    async fn load(&self, _task: &Task) -> Result<String, SourceError> {
        Ok("a".repeat(self.chars))
    }
}

/// Records accepted notes in memory.
#[derive(Default)]
pub struct MemorySink {
    pub written: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl NotesSink for MemorySink {
    async fn persist(&self, task: &Task, text: &str) -> Result<PathBuf, SinkError> {
        self.written
            .lock()
            .unwrap()
            .push((task.id, text.to_string()));
        Ok(PathBuf::from(format!("/virtual/{}_Notes.md", task.display_name)))
    }
}

/// No delays, no jitter, instant busy retries.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::new()
        .with_inter_task_delay(Duration::ZERO)
        .with_jitter(Duration::ZERO..=Duration::ZERO)
        .with_busy_backoff(BackoffPolicy::immediate(5))
}

pub fn collaborators(provider: Arc<ScriptedProvider>, sink: Arc<MemorySink>) -> Collaborators {
    Collaborators {
        provider,
        evaluator: Arc::new(ScoreEvaluator),
        source: Arc::new(MemorySource::default()),
        sink,
        persona: PersonaConfig::default(),
    }
}

/// A fresh store in a temp dir with `count` pending tasks.
pub async fn seeded_store(count: usize) -> (TempDir, TaskStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path().join("tasks.db")).await.unwrap();
    for i in 0..count {
        store
            .enqueue(&format!("/virtual/{i:03}.srt"), &format!("{i:03}"), "course")
            .await
            .unwrap();
    }
    (dir, store)
}
