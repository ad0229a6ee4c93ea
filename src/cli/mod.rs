//! Command-line interface for notes-forge.
//!
//! Provides commands for scanning transcripts, running the orchestrator,
//! and inspecting or resetting the task store.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, DEFAULT_DB_PATH};
