//! Writing finished notes next to their transcript.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::SinkError;
use crate::storage::Task;

/// Suffix appended to the transcript stem for the notes file.
pub const NOTES_SUFFIX: &str = "_Notes.md";

/// Persists an accepted synthesis. Returns where it was written.
#[async_trait]
pub trait NotesSink: Send + Sync {
    async fn persist(&self, task: &Task, text: &str) -> Result<PathBuf, SinkError>;
}

/// `lecture.srt` -> `lecture_Notes.md` in the same directory.
pub fn notes_path_for(source: &Path) -> Option<PathBuf> {
    let stem = source.file_stem()?.to_str()?;
    let parent = source.parent()?;
    Some(parent.join(format!("{}{}", stem, NOTES_SUFFIX)))
}

/// Writes markdown notes beside the source file.
///
/// The file is written to a temporary sibling and renamed over the target,
/// so a forced shutdown never leaves a half-written notes file behind.
#[derive(Debug, Clone, Default)]
pub struct MarkdownNotesSink;

#[async_trait]
impl NotesSink for MarkdownNotesSink {
    async fn persist(&self, task: &Task, text: &str) -> Result<PathBuf, SinkError> {
        let source = PathBuf::from(&task.source_locator);
        let target = notes_path_for(&source)
            .ok_or_else(|| SinkError::InvalidSourcePath(task.source_locator.clone()))?;
        let text = text.to_string();

        let written = tokio::task::spawn_blocking(move || write_atomically(&target, &text))
            .await
            .map_err(|e| SinkError::Write {
                path: task.source_locator.clone(),
                source: std::io::Error::other(e.to_string()),
            })?;

        let path = written.map_err(|source| SinkError::Write {
            path: task.source_locator.clone(),
            source,
        })?;
        debug!(task_id = task.id, path = %path.display(), "Notes written");
        Ok(path)
    }
}

fn write_atomically(target: &Path, text: &str) -> std::io::Result<PathBuf> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(text.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(target.to_path_buf())
}
