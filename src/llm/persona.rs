//! Persona configuration: who the model speaks as and how the prompt is built.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::provider::SynthesisInput;
use crate::scheduler::ConfigError;

/// Default model identifier sent to the provider.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a veteran software architect who turns raw lecture \
transcripts into thorough, opinionated study notes. You add real-world context, call out \
gotchas and anti-patterns, and never pad with filler.";

const DEFAULT_PROMPT_TEMPLATE: &str = r#"You are working on ONE transcript and nothing else.

LECTURE: {display_name}
COURSE: {group_name}

TRANSCRIPT:
{transcript}

Write comprehensive markdown notes for this lecture:
1. Cover every concept, technique, pattern and anti-pattern mentioned
2. Add practical commentary and production gotchas
3. Use ## and ### sections, bullet lists, tables and code blocks where useful
4. Aim for at least {min_length} characters of substantive analysis

Reply with the markdown notes only."#;

/// Persona and prompt settings for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    pub name: String,
    pub system_prompt: String,
    /// Placeholders: `{display_name}`, `{group_name}`, `{transcript}`, `{min_length}`.
    pub prompt_template: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Minimum length the prompt asks for; mirrors the evaluator's length check.
    pub min_length: usize,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: "architect".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: Some(0.7),
            max_tokens: Some(8192),
            min_length: 1500,
        }
    }
}

impl PersonaConfig {
    /// Loads a persona from YAML. Missing fields fall back to the defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let persona: PersonaConfig = serde_yaml::from_str(&raw)?;
        persona.validate()?;
        Ok(persona)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "persona model cannot be empty".to_string(),
            ));
        }
        if !self.prompt_template.contains("{transcript}") {
            return Err(ConfigError::ValidationFailed(
                "prompt_template must contain the {transcript} placeholder".to_string(),
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::ValidationFailed(
                    "temperature must be between 0.0 and 2.0".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Renders the user prompt for one input.
    pub fn render_prompt(&self, input: &SynthesisInput) -> String {
        self.prompt_template
            .replace("{display_name}", &input.display_name)
            .replace("{group_name}", &input.group_name)
            .replace("{min_length}", &self.min_length.to_string())
            // Last, so transcript text containing braces is never re-expanded.
            .replace("{transcript}", &input.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn input() -> SynthesisInput {
        SynthesisInput {
            display_name: "03-ownership".to_string(),
            group_name: "rust-course".to_string(),
            text: "today we talk about {group_name} and borrowing".to_string(),
        }
    }

    #[test]
    fn test_render_prompt_fills_placeholders() {
        let persona = PersonaConfig::default();
        let prompt = persona.render_prompt(&input());

        assert!(prompt.contains("LECTURE: 03-ownership"));
        assert!(prompt.contains("COURSE: rust-course"));
        assert!(prompt.contains("at least 1500 characters"));
        assert!(prompt.contains("today we talk about {group_name} and borrowing"));
    }

    #[test]
    fn test_from_yaml_merges_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name: reviewer\nmodel: openai/gpt-4o\ntemperature: 0.2").unwrap();

        let persona = PersonaConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(persona.name, "reviewer");
        assert_eq!(persona.model, "openai/gpt-4o");
        assert_eq!(persona.temperature, Some(0.2));
        assert_eq!(persona.system_prompt, PersonaConfig::default().system_prompt);
    }

    #[test]
    fn test_validate_rejects_template_without_transcript() {
        let persona = PersonaConfig {
            prompt_template: "summarise {display_name}".to_string(),
            ..Default::default()
        };
        assert!(persona.validate().is_err());

        let persona = PersonaConfig {
            temperature: Some(3.5),
            ..Default::default()
        };
        assert!(persona.validate().is_err());
    }
}
