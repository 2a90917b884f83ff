use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use phishload_sync::{connect_from_config, RunOptions, SyncConfig, SyncError, DEFAULT_BATCH_SIZE};
use tracing::error;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "phishload")]
#[command(about = "Load the PhishTank feed into the record store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the feed and upsert every valid record (default)
    Sync(SyncArgs),
    /// Probe the store and ensure the key index, then exit
    Check,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Stop after this many feed rows
    #[arg(long)]
    limit: Option<u64>,

    /// Records per bulk upsert
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, value_parser = parse_batch_size)]
    batch_size: usize,
}

impl Default for SyncArgs {
    fn default() -> Self {
        Self {
            limit: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl From<&SyncArgs> for RunOptions {
    fn from(args: &SyncArgs) -> Self {
        RunOptions {
            limit: args.limit,
            batch_size: args.batch_size,
        }
    }
}

fn parse_batch_size(raw: &str) -> std::result::Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("batch size must be at least 1".to_string()),
        Ok(size) => Ok(size),
        Err(err) => Err(err.to_string()),
    }
}

fn abort_message(err: &SyncError) -> String {
    match err {
        SyncError::Fetch(err) => format!("Failed to fetch data: {err}"),
        SyncError::FeedHeader(_) => format!("Failed to read the feed: {err}"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig::from_env().context("reading configuration")?;
    let pipeline = connect_from_config(&config)
        .await
        .context("could not reach the record store; check DATABASE_URL and network access")?;

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Check => {
            println!("store reachable; table {} ready", config.table);
        }
        Commands::Sync(args) => match pipeline.run_once(&RunOptions::from(&args)).await {
            Ok(summary) => println!("{}", summary.counters.summary_line()),
            // Nothing was written yet, so the process still exits cleanly.
            Err(err) => println!("{}", abort_message(&err)),
        },
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    if let Err(err) = logging::init(cli.verbose) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = format!("{err:#}"), "phishload failed");
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
