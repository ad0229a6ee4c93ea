//! CLI command definitions for notes-forge.
//!
//! `run` is the main entry point: optionally scan folders, then drive the
//! orchestrator until the queue is empty. The remaining commands are
//! administrative views and resets over the task store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::llm::{LiteLlmClient, PersonaConfig, DEFAULT_API_BASE};
use crate::quality::HeuristicEvaluator;
use crate::scheduler::{
    Collaborators, ExitGuard, Orchestrator, OrchestratorConfig, RunOutcome, ShutdownCoordinator,
    StopReason,
};
use crate::storage::{RunSummary, TaskStore, DEFAULT_MAX_ATTEMPTS};
use crate::transcripts::{self, MarkdownNotesSink, SrtTranscriptSource};

/// Default task database file.
pub const DEFAULT_DB_PATH: &str = "synthesis_tasks.db";

/// Turn lecture transcripts into study notes with an LLM, durably and in parallel.
#[derive(Parser)]
#[command(name = "notes-forge")]
#[command(about = "Generate markdown study notes from lecture transcripts")]
#[command(version)]
#[command(
    long_about = "notes-forge queues .srt transcripts in a SQLite task store and drives an LLM over them \
with a bounded worker pool, a quality gate and automatic retries.\n\n\
Press Ctrl+C once to finish in-flight work and stop; press it again to quit immediately.\n\n\
Example usage:\n  notes-forge run ./courses/rust --recursive --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Task database path.
    #[arg(long, default_value = DEFAULT_DB_PATH, env = "NOTES_FORGE_DB", global = true)]
    pub db: PathBuf,

    /// Attempt budget for tasks queued or re-opened by this command.
    #[arg(
        long,
        env = "NOTES_FORGE_MAX_ATTEMPTS",
        global = true,
        default_value_t = DEFAULT_MAX_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_attempts: u32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Find transcripts without notes and add them to the queue.
    Scan(ScanArgs),

    /// Process the queue (optionally scanning folders first).
    Run(RunArgs),

    /// Show queue statistics and recent rounds.
    Stats,

    /// List tasks that exhausted their attempts.
    ListFailed,

    /// Give failed tasks a fresh attempt budget.
    RetryFailed,

    /// Return tasks stuck in processing to pending.
    ResetStuck(ResetStuckArgs),

    /// Delete every task and round record.
    ResetDb(ResetDbArgs),
}

/// Arguments for `notes-forge scan`.
#[derive(Parser, Debug)]
pub struct ScanArgs {
    /// Folders containing .srt transcripts.
    #[arg(required = true)]
    pub folders: Vec<PathBuf>,

    /// Descend into subfolders.
    #[arg(short, long)]
    pub recursive: bool,
}

/// Arguments for `notes-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Folders to scan before processing.
    pub folders: Vec<PathBuf>,

    /// Descend into subfolders when scanning.
    #[arg(short, long)]
    pub recursive: bool,

    /// Concurrent workers.
    #[arg(short, long, env = "NOTES_FORGE_WORKERS")]
    pub workers: Option<usize>,

    /// Tasks per worker per round.
    #[arg(short, long, env = "NOTES_FORGE_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Maximum simultaneous provider calls.
    #[arg(long, env = "NOTES_FORGE_MAX_CONCURRENT_CALLS")]
    pub max_concurrent: Option<usize>,

    /// Minimum quality score to accept notes.
    #[arg(short, long)]
    pub threshold: Option<f64>,

    /// Persona YAML file.
    #[arg(short, long)]
    pub persona: Option<PathBuf>,

    /// Model identifier (overrides the persona's).
    #[arg(short, long)]
    pub model: Option<String>,

    /// Provider base URL.
    #[arg(long, env = "LITELLM_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Provider API key.
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Print the effective configuration and queue state, then exit.
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for `notes-forge reset-stuck`.
#[derive(Parser, Debug)]
pub struct ResetStuckArgs {
    /// Only reset tasks claimed more than this many seconds ago.
    #[arg(long, default_value = "1800")]
    pub older_than: u64,
}

/// Arguments for `notes-forge reset-db`.
#[derive(Parser, Debug)]
pub struct ResetDbArgs {
    /// Confirm deletion.
    #[arg(long)]
    pub yes: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let store = TaskStore::open(&cli.db)
        .await
        .with_context(|| format!("Failed to open task database {}", cli.db.display()))?
        .with_default_max_attempts(cli.max_attempts);

    match cli.command {
        Commands::Scan(args) => run_scan_command(&store, &args.folders, args.recursive).await,
        Commands::Run(args) => run_run_command(store, args).await,
        Commands::Stats => run_stats_command(&store).await,
        Commands::ListFailed => run_list_failed_command(&store).await,
        Commands::RetryFailed => {
            let reset = store.reset_failed().await?;
            println!("Re-queued {} failed task(s)", reset);
            Ok(())
        }
        Commands::ResetStuck(args) => {
            let reset = store
                .reset_stuck(Duration::from_secs(args.older_than))
                .await?;
            println!("Returned {} stuck task(s) to pending", reset);
            Ok(())
        }
        Commands::ResetDb(args) => {
            if !args.yes {
                anyhow::bail!(
                    "reset-db deletes every task in {}; re-run with --yes to confirm",
                    cli.db.display()
                );
            }
            let deleted = store.purge().await?;
            println!("Deleted {} task(s)", deleted);
            Ok(())
        }
    }
}

async fn run_scan_command(
    store: &TaskStore,
    folders: &[PathBuf],
    recursive: bool,
) -> anyhow::Result<()> {
    let items = transcripts::scan(folders, recursive);
    let summary = transcripts::enqueue_all(store, &items).await?;
    println!(
        "Found {} transcript(s) without notes: {} queued, {} already known",
        items.len(),
        summary.added,
        summary.duplicates
    );
    Ok(())
}

fn build_config(args: &RunArgs) -> anyhow::Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::from_env().context("Invalid NOTES_FORGE_* environment")?;
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(max) = args.max_concurrent {
        config = config.with_max_concurrent_calls(max);
    }
    if let Some(threshold) = args.threshold {
        config = config.with_quality_threshold(threshold);
    }
    config.validate()?;
    Ok(config)
}

fn load_persona(args: &RunArgs) -> anyhow::Result<PersonaConfig> {
    let mut persona = match &args.persona {
        Some(path) => PersonaConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load persona {}", path.display()))?,
        None => PersonaConfig::default(),
    };
    if let Some(model) = &args.model {
        persona = persona.with_model(model.clone());
    }
    persona.validate()?;
    Ok(persona)
}

async fn run_run_command(store: TaskStore, args: RunArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?.with_max_attempts(store.default_max_attempts());
    let persona = load_persona(&args)?;

    if !args.folders.is_empty() {
        run_scan_command(&store, &args.folders, args.recursive).await?;
    }

    if args.dry_run {
        print_dry_run(&config, &persona, &args, &store.statistics().await?);
        return Ok(());
    }

    let api_key = args
        .api_key
        .clone()
        .or_else(|| std::env::var("LITELLM_API_KEY").ok());
    if api_key.is_none() {
        warn!("No API key configured; requests are sent unauthenticated");
    }
    let provider = LiteLlmClient::new(args.api_base.clone(), api_key);

    let shutdown = ShutdownCoordinator::new();
    let handle = shutdown.handle();
    let _signals = shutdown.listen_for_signals();

    let exit_guard = ExitGuard::new();
    {
        let handle = handle.clone();
        exit_guard.on_exit("stuck-task-hint", move || {
            if handle.is_forced() {
                eprintln!(
                    "Forced shutdown: some tasks may still be marked processing. \
                     They are reset on the next run, or with `notes-forge reset-stuck`."
                );
            }
        });
    }

    let collaborators = Collaborators {
        provider: Arc::new(provider),
        evaluator: Arc::new(HeuristicEvaluator::new(persona.min_length)),
        source: Arc::new(SrtTranscriptSource),
        sink: Arc::new(MarkdownNotesSink),
        persona,
    };

    let mut orchestrator = Orchestrator::new(config, store.clone(), collaborators, handle)?;
    let outcome = orchestrator.run().await?;

    print_outcome(&outcome);
    print_summary(&store.statistics().await?);
    Ok(())
}

fn print_dry_run(
    config: &OrchestratorConfig,
    persona: &PersonaConfig,
    args: &RunArgs,
    summary: &RunSummary,
) {
    println!("=== Dry run ===");
    println!("Workers:          {}", config.workers);
    println!("Batch size:       {}", config.batch_size);
    println!("Per round:        {}", config.round_capacity());
    println!("Max concurrent:   {}", config.max_concurrent_calls);
    println!("Max attempts:     {}", config.max_attempts);
    println!("Threshold:        {:.2}", config.quality_threshold);
    println!("Inter-task delay: {:?}", config.inter_task_delay);
    println!(
        "Jitter:           {:?}..={:?}",
        config.jitter.start(),
        config.jitter.end()
    );
    println!("Persona:          {} ({})", persona.name, persona.model);
    println!("API base:         {}", args.api_base);
    println!(
        "API key:          {}",
        if args.api_key.is_some() { "set" } else { "not set" }
    );
    println!();
    print_summary(summary);
}

fn print_outcome(outcome: &RunOutcome) {
    let stop = match outcome.stop {
        StopReason::Exhausted => "queue empty",
        StopReason::Drained => "drained after interrupt",
        StopReason::Forced => "forced shutdown",
    };
    info!(rounds = outcome.rounds.len(), completed = outcome.total_completed(), stop, "Run ended");
    println!();
    println!(
        "Run ended ({}): {} round(s), {} task(s) completed",
        stop,
        outcome.rounds.len(),
        outcome.total_completed()
    );
    if outcome.reconciled > 0 {
        println!("Recovered {} task(s) left processing by an earlier run", outcome.reconciled);
    }
}

fn print_summary(summary: &RunSummary) {
    println!("=== Queue statistics ===");
    println!("Total:      {}", summary.total);
    println!(
        "Completed:  {} ({:.1}%)",
        summary.completed,
        summary.percent(summary.completed)
    );
    println!("Pending:    {}", summary.pending);
    println!("Processing: {}", summary.processing);
    println!(
        "Failed:     {} ({:.1}%)",
        summary.failed,
        summary.percent(summary.failed)
    );
    match summary.average_quality {
        Some(q) => println!("Avg quality: {:.2}", q),
        None => println!("Avg quality: n/a"),
    }
    println!("Tokens used: {}", summary.total_tokens);
}

async fn run_stats_command(store: &TaskStore) -> anyhow::Result<()> {
    print_summary(&store.statistics().await?);

    let rounds = store.recent_rounds(10).await?;
    if !rounds.is_empty() {
        println!();
        println!("=== Recent rounds ===");
        for r in rounds {
            println!(
                "{}  round {:>3}: claimed {:>3}, completed {:>3}, retry {:>3}, failed {:>3}, released {:>3}, {:.1}s",
                r.started_at.format("%Y-%m-%d %H:%M:%S"),
                r.round,
                r.claimed,
                r.completed,
                r.requeued,
                r.failed,
                r.released,
                r.elapsed.as_secs_f64()
            );
        }
    }
    Ok(())
}

async fn run_list_failed_command(store: &TaskStore) -> anyhow::Result<()> {
    let failed = store.list_failed().await?;
    if failed.is_empty() {
        println!("No failed tasks.");
        return Ok(());
    }

    println!("{} failed task(s):", failed.len());
    for task in failed {
        let name = Path::new(&task.source_locator)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| task.source_locator.clone());
        println!(
            "  [{}] {}/{} ({}/{} attempts)",
            task.id, task.group_name, name, task.attempts, task.max_attempts
        );
        if let Some(err) = task.error_message {
            println!("      {}", err);
        }
    }
    println!();
    println!("Run `notes-forge retry-failed` to queue them again.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::DEFAULT_QUALITY_THRESHOLD;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_override_config() {
        let cli = Cli::try_parse_from([
            "notes-forge",
            "run",
            "./courses",
            "--workers",
            "4",
            "--batch-size",
            "5",
            "--threshold",
            "0.5",
            "--dry-run",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.folders, vec![PathBuf::from("./courses")]);
        assert!(args.dry_run);

        let config = build_config(&args).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.round_capacity(), 20);
        assert_eq!(config.quality_threshold, 0.5);
    }

    #[test]
    fn test_global_db_flag() {
        let cli = Cli::try_parse_from(["notes-forge", "stats", "--db", "/tmp/x.db"]).unwrap();
        assert_eq!(cli.db, PathBuf::from("/tmp/x.db"));
        assert!(matches!(cli.command, Commands::Stats));
    }

    #[tokio::test]
    async fn test_scan_and_retry_use_max_attempts_flag() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tasks.db");
        let course = dir.path().join("course");
        std::fs::create_dir(&course).unwrap();
        let transcript = course.join("lecture-01.srt");
        std::fs::write(&transcript, "1\n00:00:01,000 --> 00:00:02,000\nHello\n").unwrap();

        let db_arg = db.to_string_lossy().into_owned();
        let course_arg = course.to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "notes-forge",
            "scan",
            course_arg.as_str(),
            "--db",
            db_arg.as_str(),
            "--max-attempts",
            "2",
        ])
        .unwrap();
        run_with_cli(cli).await.unwrap();

        let store = TaskStore::open(&db).await.unwrap();
        let locator = transcript.to_string_lossy();
        let task = store.find_by_locator(&locator).await.unwrap().unwrap();
        assert_eq!(task.max_attempts, 2);

        for _ in 0..2 {
            let claimed = store.claim_batch(1).await.unwrap().remove(0);
            store.fail_attempt(claimed.id, "timeout").await.unwrap();
        }
        assert_eq!(store.list_failed().await.unwrap().len(), 1);

        let cli = Cli::try_parse_from([
            "notes-forge",
            "retry-failed",
            "--db",
            db_arg.as_str(),
            "--max-attempts",
            "4",
        ])
        .unwrap();
        run_with_cli(cli).await.unwrap();

        let task = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.attempts, 2);
        assert_eq!(task.max_attempts, 6);
    }

    #[test]
    fn test_zero_max_attempts_is_rejected() {
        assert!(Cli::try_parse_from(["notes-forge", "stats", "--max-attempts", "0"]).is_err());
    }

    #[test]
    fn test_default_threshold_matches_evaluator() {
        let cli = Cli::try_parse_from(["notes-forge", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.threshold, None);
        assert_eq!(
            build_config(&args).unwrap().quality_threshold,
            DEFAULT_QUALITY_THRESHOLD
        );
    }
}
