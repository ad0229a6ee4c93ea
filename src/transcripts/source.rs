//! Loading and cleaning `.srt` transcripts.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::SourceError;
use crate::storage::Task;

/// Inline formatting tags some subtitle tools emit (`<i>`, `<font ...>`).
static MARKUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").expect("Invalid regex for subtitle markup"));

/// Supplies the cleaned input text for a task.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn load(&self, task: &Task) -> Result<String, SourceError>;
}

/// Reads the task's `source_locator` as a path to an `.srt` file.
#[derive(Debug, Clone, Default)]
pub struct SrtTranscriptSource;

#[async_trait]
impl TranscriptSource for SrtTranscriptSource {
    async fn load(&self, task: &Task) -> Result<String, SourceError> {
        let bytes = tokio::fs::read(&task.source_locator)
            .await
            .map_err(|source| SourceError::Read {
                path: task.source_locator.clone(),
                source,
            })?;

        let cleaned = clean_srt(&String::from_utf8_lossy(&bytes));
        if cleaned.is_empty() {
            return Err(SourceError::Empty(task.source_locator.clone()));
        }
        Ok(cleaned)
    }
}

/// Drops cue numbers, timing lines and markup, joining the spoken text
/// into a single space-separated string.
pub fn clean_srt(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.chars().all(|c| c.is_ascii_digit()))
        .filter(|line| !line.contains("-->"))
        .map(|line| MARKUP_TAG.replace_all(line, ""))
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
