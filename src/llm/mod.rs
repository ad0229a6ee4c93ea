//! LLM integration for notes-forge.
//!
//! The orchestration core only sees the [`SynthesisProvider`] trait. This
//! module supplies it, the persona/prompt configuration it is called with,
//! and a LiteLLM/OpenAI-compatible HTTP implementation.
//!
//! ```ignore
//! use notes_forge::llm::{LiteLlmClient, PersonaConfig, SynthesisInput, SynthesisProvider};
//!
//! let client = LiteLlmClient::from_env();
//! let persona = PersonaConfig::default();
//! let input = SynthesisInput {
//!     display_name: "01-intro".into(),
//!     group_name: "rust".into(),
//!     text: transcript,
//! };
//! let synthesis = client.generate(&persona, &input).await?;
//! ```

pub mod litellm;
pub mod persona;
pub mod provider;

pub use litellm::{LiteLlmClient, Message, DEFAULT_API_BASE};
pub use persona::{PersonaConfig, DEFAULT_MODEL};
pub use provider::{Synthesis, SynthesisInput, SynthesisProvider};
