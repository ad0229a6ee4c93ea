//! The synthesis provider seam consumed by workers.

use async_trait::async_trait;

use super::persona::PersonaConfig;
use crate::error::ProviderError;

/// Cleaned input handed to a provider for one task.
#[derive(Debug, Clone)]
pub struct SynthesisInput {
    pub display_name: String,
    pub group_name: String,
    pub text: String,
}

/// Generated text plus the accounting fields recorded on completion.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub text: String,
    pub tokens_used: Option<i64>,
    pub model: String,
}

/// A slow, rate-limited text generator.
///
/// Implementations classify contention as `ProviderError::Busy` so the rate
/// limiter can retry it without charging the task an attempt.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    async fn generate(
        &self,
        persona: &PersonaConfig,
        input: &SynthesisInput,
    ) -> Result<Synthesis, ProviderError>;
}
