//! LiteLLM/OpenAI-compatible chat-completions provider.
//!
//! Works against LiteLLM proxies, OpenRouter, or any endpoint exposing
//! `POST {api_base}/chat/completions`.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::persona::PersonaConfig;
use super::provider::{Synthesis, SynthesisInput, SynthesisProvider};
use crate::error::ProviderError;

/// Default API endpoint when none is configured.
pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";

/// Request timeout. Long transcripts take minutes to synthesize.
const REQUEST_TIMEOUT_SECS: u64 = 600;

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Client for LiteLLM-compatible APIs.
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    http_client: Client,
}

impl LiteLlmClient {
    /// Create a client with explicit configuration.
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_timeout(api_base, api_key, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        api_base: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
            http_client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Create a client from environment variables.
    ///
    /// - `LITELLM_API_BASE`: base URL (default: OpenRouter)
    /// - `LITELLM_API_KEY` or `OPENROUTER_API_KEY`: bearer token (optional)
    pub fn from_env() -> Self {
        let api_base = env::var("LITELLM_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let api_key = env::var("LITELLM_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok();
        Self::new(api_base, api_key)
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn classify_transport(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

/// Maps a non-success HTTP status to the provider error taxonomy.
fn classify_status(status: StatusCode, message: String) -> ProviderError {
    match status.as_u16() {
        // 529 is the "overloaded" status some upstreams use.
        429 | 503 | 529 => ProviderError::Busy(format!("{}: {}", status, message)),
        408 | 504 => ProviderError::Unavailable(format!("gateway timeout {}: {}", status, message)),
        _ => ProviderError::Unavailable(format!("API error ({}): {}", status, message)),
    }
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    total_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl SynthesisProvider for LiteLlmClient {
    async fn generate(
        &self,
        persona: &PersonaConfig,
        input: &SynthesisInput,
    ) -> Result<Synthesis, ProviderError> {
        let api_request = ApiRequest {
            model: &persona.model,
            messages: vec![
                Message::system(persona.system_prompt.clone()),
                Message::user(persona.render_prompt(input)),
            ],
            temperature: persona.temperature,
            max_tokens: persona.max_tokens,
        };

        let url = format!("{}/chat/completions", self.api_base);
        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Title", "notes-forge");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        debug!(model = %persona.model, lecture = %input.display_name, "Sending synthesis request");

        let http_response = http_request
            .json(&api_request)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = http_response.status();
        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|r| r.error.message)
                .unwrap_or(error_text);
            return Err(classify_status(status, message));
        }

        let api_response: ApiResponse = http_response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse API response: {}", e))
        })?;

        let text = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("empty completion".to_string()))?;

        Ok(Synthesis {
            text,
            tokens_used: api_response.usage.map(|u| u.total_tokens),
            model: api_response.model.unwrap_or_else(|| persona.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into()).is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "overloaded".into()).is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "bad key".into()).is_transient());
        assert!(!classify_status(StatusCode::GATEWAY_TIMEOUT, "upstream".into()).is_transient());
    }

    #[test]
    fn test_api_base_is_normalised() {
        let client = LiteLlmClient::new("http://localhost:4000/", None);
        assert_eq!(client.api_base(), "http://localhost:4000");
        assert!(!client.has_api_key());
    }

    #[test]
    fn test_response_parsing_tolerates_missing_usage() {
        let raw = r###"{"choices":[{"message":{"role":"assistant","content":"## Notes"}}]}"###;
        let parsed: ApiResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.usage.is_none());
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("## Notes"));
    }
}
