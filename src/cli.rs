//! Command-line interface for newsmill.
//!
//! Operator tooling over the identity store: dedup checks, status
//! reporting, cross-session reconciliation, and retention pruning. The
//! processing run itself is driven by the embedding application through
//! [`crate::controller::Controller`], since extraction and rewriting are
//! injected collaborators.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use crate::pipeline::FsOutputSink;
use crate::reconcile::ReconcileJob;
use crate::store::HistoryStore;

const DEFAULT_DB: &str = "./newsmill.db";

/// Deduplicating article ingestion pipeline with adaptive concurrency.
#[derive(Parser)]
#[command(name = "newsmill")]
#[command(about = "Inspect and maintain the article identity store")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the identity store database.
    #[arg(long, default_value = DEFAULT_DB, global = true, env = "NEWSMILL_DB")]
    pub db: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Partition candidate URLs into new vs already-known.
    Check(CheckArgs),

    /// Show store counts and recent activity.
    Status(StatusArgs),

    /// Resolve failed records that completed in another session's store.
    Reconcile(ReconcileArgs),

    /// Delete records older than a retention window.
    Prune(PruneArgs),
}

/// Arguments for `newsmill check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// URLs to check. Reads one URL per line from stdin when empty.
    pub urls: Vec<String>,
}

/// Arguments for `newsmill status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Window for the recent-activity summary, in days.
    #[arg(long, default_value = "7")]
    pub days: i64,
}

/// Arguments for `newsmill reconcile`.
#[derive(Parser, Debug)]
pub struct ReconcileArgs {
    /// Other sessions' store databases to check for completions.
    #[arg(required = true)]
    pub history: Vec<PathBuf>,

    /// Root directory holding session output folders.
    #[arg(long, default_value = "./output")]
    pub output_root: PathBuf,

    /// Report what would change without writing anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for `newsmill prune`.
#[derive(Parser, Debug)]
pub struct PruneArgs {
    /// Drop records whose last activity is older than this many days.
    #[arg(long, default_value = "90")]
    pub days: i64,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let store = HistoryStore::open(&cli.db).await?;
    match cli.command {
        Commands::Check(args) => check(&store, args).await,
        Commands::Status(args) => status(&store, args).await,
        Commands::Reconcile(args) => reconcile(&store, args).await,
        Commands::Prune(args) => prune(&store, args).await,
    }
}

async fn check(store: &HistoryStore, args: CheckArgs) -> anyhow::Result<()> {
    let urls = if args.urls.is_empty() {
        read_urls_from_stdin()?
    } else {
        args.urls
    };
    let result = store.batch_check(&urls).await?;

    println!(
        "{} checked: {} new, {} known",
        result.stats.total, result.stats.new, result.stats.duplicate
    );
    for url in &result.new {
        println!("new        {}", url);
    }
    for dup in &result.duplicates {
        println!("{:<10} {}  ({})", dup.status.as_str(), dup.url, dup.reason);
    }
    Ok(())
}

fn read_urls_from_stdin() -> anyhow::Result<Vec<String>> {
    use std::io::BufRead;
    let mut urls = Vec::new();
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            urls.push(trimmed.to_string());
        }
    }
    Ok(urls)
}

async fn status(store: &HistoryStore, args: StatusArgs) -> anyhow::Result<()> {
    let stats = store.stats().await?;
    let history = store.processing_history(args.days).await?;

    println!("work items:      {}", stats.total);
    println!("  processing:    {}", stats.processing);
    println!("  completed:     {}", stats.completed);
    println!("  failed:        {}", stats.failed);
    println!("  duplicate:     {}", stats.duplicate);
    println!("  skipped:       {}", stats.skipped);
    println!("content records: {}", stats.content_records);
    println!(
        "last {} days:    {} items, {} contents",
        args.days, history.recent_urls, history.recent_contents
    );
    Ok(())
}

async fn reconcile(store: &HistoryStore, args: ReconcileArgs) -> anyhow::Result<()> {
    let sink = FsOutputSink::new(args.output_root);
    let mut job = ReconcileJob::new(store.clone(), args.history);
    if args.dry_run {
        job = job.dry_run();
    }
    let report = job.run(&sink).await?;
    println!(
        "{} failed records examined: {} resolved as duplicates, {} genuinely failed{}",
        report.examined,
        report.reconciled,
        report.genuinely_failed,
        if args.dry_run { " (dry run)" } else { "" }
    );
    Ok(())
}

async fn prune(store: &HistoryStore, args: PruneArgs) -> anyhow::Result<()> {
    let pruned = store.prune_older_than(args.days).await?;
    info!(pruned = pruned, days = args.days, "prune finished");
    println!("pruned {} records older than {} days", pruned, args.days);
    Ok(())
}
