//! Transcript collaborators: discovery, loading and notes output.
//!
//! The orchestrator only depends on the [`TranscriptSource`] and
//! [`NotesSink`] traits; the `.srt`/markdown implementations live here.

pub mod discovery;
pub mod notes;
pub mod source;

pub use discovery::{enqueue_all, scan, DiscoveredItem, EnqueueSummary};
pub use notes::{notes_path_for, MarkdownNotesSink, NotesSink, NOTES_SUFFIX};
pub use source::{clean_srt, SrtTranscriptSource, TranscriptSource};
