//! Orchestrator configuration.
//!
//! Defaults suit a single operator running against a hosted provider:
//! one worker, batches of ten, generous provider concurrency.

use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

use super::rate_limiter::BackoffPolicy;
use crate::quality::DEFAULT_QUALITY_THRESHOLD;
use crate::storage::DEFAULT_MAX_ATTEMPTS;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A persona file could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for an orchestrated run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Pool shape
    /// Number of concurrent workers per round.
    pub workers: usize,
    /// Tasks handed to each worker per round.
    pub batch_size: usize,

    // Retry protocol
    /// Attempt budget for newly enqueued tasks.
    pub max_attempts: u32,
    /// Minimum evaluator score to accept a synthesis.
    pub quality_threshold: f64,
    /// Inputs longer than this fail the attempt without a provider call.
    pub max_input_chars: usize,

    // Rate limiting
    /// Upper bound on simultaneous provider calls across all workers.
    pub max_concurrent_calls: usize,
    /// Pause a worker takes after each task.
    pub inter_task_delay: Duration,
    /// Random hold applied to each released permit.
    pub jitter: RangeInclusive<Duration>,
    /// Backoff for provider `Busy` responses.
    pub busy_backoff: BackoffPolicy,

    // Reconciliation
    /// `processing` rows older than this are swept back to `pending` at startup.
    pub stuck_task_age: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: 10,

            max_attempts: DEFAULT_MAX_ATTEMPTS,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            max_input_chars: 50_000,

            max_concurrent_calls: 10,
            inter_task_delay: Duration::from_millis(500),
            jitter: Duration::from_millis(100)..=Duration::from_millis(500),
            busy_backoff: BackoffPolicy::default(),

            // One process owns the store, so anything still processing at
            // startup was abandoned by a previous run.
            stuck_task_age: Duration::ZERO,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `NOTES_FORGE_WORKERS`: Worker count (default: 1)
    /// - `NOTES_FORGE_BATCH_SIZE`: Tasks per worker per round (default: 10)
    /// - `NOTES_FORGE_MAX_ATTEMPTS`: Attempt budget per task (default: 3)
    /// - `NOTES_FORGE_QUALITY_THRESHOLD`: Pass threshold in [0, 1] (default: 0.7)
    /// - `NOTES_FORGE_MAX_INPUT_CHARS`: Input size limit (default: 50000)
    /// - `NOTES_FORGE_MAX_CONCURRENT_CALLS`: Provider concurrency (default: 10)
    /// - `NOTES_FORGE_INTER_TASK_DELAY_MS`: Delay between tasks (default: 500)
    /// - `NOTES_FORGE_JITTER_MS`: Jitter range as `min-max` (default: 100-500)
    /// - `NOTES_FORGE_BUSY_RETRIES`: Retries on provider busy (default: 5)
    /// - `NOTES_FORGE_STUCK_TASK_SECS`: Startup sweep age (default: 0)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("NOTES_FORGE_WORKERS") {
            config.workers = parse_env_value(&val, "NOTES_FORGE_WORKERS")?;
        }

        if let Ok(val) = std::env::var("NOTES_FORGE_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "NOTES_FORGE_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("NOTES_FORGE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "NOTES_FORGE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("NOTES_FORGE_QUALITY_THRESHOLD") {
            config.quality_threshold = parse_env_value(&val, "NOTES_FORGE_QUALITY_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("NOTES_FORGE_MAX_INPUT_CHARS") {
            config.max_input_chars = parse_env_value(&val, "NOTES_FORGE_MAX_INPUT_CHARS")?;
        }

        if let Ok(val) = std::env::var("NOTES_FORGE_MAX_CONCURRENT_CALLS") {
            config.max_concurrent_calls =
                parse_env_value(&val, "NOTES_FORGE_MAX_CONCURRENT_CALLS")?;
        }

        if let Ok(val) = std::env::var("NOTES_FORGE_INTER_TASK_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "NOTES_FORGE_INTER_TASK_DELAY_MS")?;
            config.inter_task_delay = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("NOTES_FORGE_JITTER_MS") {
            config.jitter = parse_jitter_range(&val, "NOTES_FORGE_JITTER_MS")?;
        }

        if let Ok(val) = std::env::var("NOTES_FORGE_BUSY_RETRIES") {
            config.busy_backoff.max_retries = parse_env_value(&val, "NOTES_FORGE_BUSY_RETRIES")?;
        }

        if let Ok(val) = std::env::var("NOTES_FORGE_STUCK_TASK_SECS") {
            let secs: u64 = parse_env_value(&val, "NOTES_FORGE_STUCK_TASK_SECS")?;
            config.stuck_task_age = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(ConfigError::ValidationFailed(
                "quality_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.max_input_chars == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_input_chars must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_calls must be greater than 0".to_string(),
            ));
        }

        if self.jitter.start() > self.jitter.end() {
            return Err(ConfigError::ValidationFailed(
                "jitter minimum cannot exceed its maximum".to_string(),
            ));
        }

        if self.busy_backoff.multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "busy backoff multiplier must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Tasks requested from the store per round.
    pub fn round_capacity(&self) -> usize {
        self.workers.saturating_mul(self.batch_size)
    }

    /// Builder method to set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Builder method to set the tasks per worker per round.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder method to set the attempt budget per task.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builder method to set the quality pass threshold.
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    /// Builder method to set the input size limit.
    pub fn with_max_input_chars(mut self, max: usize) -> Self {
        self.max_input_chars = max;
        self
    }

    /// Builder method to set the provider concurrency limit.
    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    /// Builder method to set the delay between tasks.
    pub fn with_inter_task_delay(mut self, delay: Duration) -> Self {
        self.inter_task_delay = delay;
        self
    }

    /// Builder method to set the permit release jitter range.
    pub fn with_jitter(mut self, jitter: RangeInclusive<Duration>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Builder method to set the busy retry policy.
    pub fn with_busy_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.busy_backoff = policy;
        self
    }

    /// Builder method to set the startup sweep age.
    pub fn with_stuck_task_age(mut self, age: Duration) -> Self {
        self.stuck_task_age = age;
        self
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse `min-max` milliseconds; a single number means a fixed delay.
fn parse_jitter_range(value: &str, key: &str) -> Result<RangeInclusive<Duration>, ConfigError> {
    let (min, max) = match value.split_once('-') {
        Some((min, max)) => (min, max),
        None => (value, value),
    };
    let min: u64 = parse_env_value(min, key)?;
    let max: u64 = parse_env_value(max, key)?;
    Ok(Duration::from_millis(min)..=Duration::from_millis(max))
}
