//! rclone-tracker: resumable, directory-by-directory rclone transfers.
//!
//! A backup or restore is expanded once into an ordered list of directories,
//! persisted in a SQLite tracker, and worked through one `rclone copy` at a
//! time. Interrupting and re-running the same command picks up where the
//! last run stopped. A fully successful run archives the tracker into the
//! log directory.

#![warn(clippy::all)]

mod backoff;
mod cli;
mod config;
mod decode;
mod engine;
mod enumerate;
mod import;
mod shutdown;
mod state;
mod transfer;
mod types;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use engine::{ResumeEngine, RunOutcome};
use enumerate::{Enumerator, LocalEnumerator, RemoteEnumerator};
use state::JobStore;
use transfer::RcloneTransfer;
use types::Direction;

/// Run a backup or restore to completion, failure, or interruption.
async fn run_transfers(args: cli::RunArgs, direction: Direction) -> anyhow::Result<ExitCode> {
    let config = config::Config::from_cli(args, direction)?;
    tracing::debug!(?config, "Resolved configuration");
    let prefixes = config.prefixes()?;
    let shutdown_token = shutdown::install_signal_handler();

    let enumerator: Box<dyn Enumerator> = match direction {
        Direction::Backup => Box::new(LocalEnumerator),
        Direction::Restore => Box::new(RemoteEnumerator::new(
            config.rclone.clone(),
            config.remote_name.clone(),
        )),
    };
    let store =
        engine::prepare_store(config.tracker(), &config.sources, enumerator.as_ref()).await?;

    let transfer = RcloneTransfer::new(config.rclone.clone(), config.rate_limit_markers.clone());
    tracing::info!(
        direction = direction.as_str(),
        remote = %config.remote_name,
        "Starting rclone-tracker"
    );

    let outcome = ResumeEngine::new(store, Box::new(transfer), prefixes, config.log_dir.clone())
        .with_verbosity(config.verbosity)
        .with_retry_failed(config.retry_failed)
        .run(shutdown_token)
        .await?;

    match &outcome {
        RunOutcome::Completed { archived_to } => {
            tracing::info!(
                "Done with {} of {:?}, tracker saved as {}",
                direction.as_str(),
                config.sources,
                archived_to.display()
            );
        }
        RunOutcome::Failed {
            failures,
            unprocessed,
        } => {
            tracing::error!(
                "{} failed item(s), {} not yet done; re-run with --retry-failed to retry",
                failures.len(),
                unprocessed
            );
        }
        RunOutcome::Interrupted { cursor } => {
            tracing::warn!(
                "Stopped at item {}; re-run the same command to resume",
                cursor
            );
        }
    }

    Ok(ExitCode::from(outcome.exit_code()))
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<ExitCode> {
    let db_path = config::expand_tilde(&args.tracker);

    if !db_path.exists() {
        println!("No tracker found at {}", db_path.display());
        println!("Either no run has started yet, or the last run completed and was archived.");
        return Ok(ExitCode::SUCCESS);
    }

    let store = state::SqliteJobStore::load(&db_path).await?;
    let summary = store.summary().await?;

    println!("Tracker: {}", store.path().display());
    println!();
    println!("Items:");
    println!("  Total:   {}", summary.total);
    println!("  Done:    {}", summary.done);
    println!("  Pending: {}", summary.pending);
    println!("  Failed:  {}", summary.failed);
    println!("  Next:    {}", summary.cursor);

    if let Some(item) = store.work_item(summary.cursor).await? {
        println!("  Next path: {} ({})", item.path, item.status().as_str());
    }

    if args.failed && summary.failed > 0 {
        println!();
        println!("Failed items:");
        for item in store.list_failures().await? {
            println!(
                "  {} ({}) - {}",
                item.path,
                item.id,
                item.failure.as_deref().unwrap_or("unknown error").trim_end()
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Run the import-json command.
async fn run_import_json(args: cli::ImportArgs) -> anyhow::Result<ExitCode> {
    let json = config::expand_tilde(&args.json);
    let output: PathBuf = match &args.output {
        Some(output) => config::expand_tilde(output),
        None => import::default_output(&json),
    };

    let summary = import::import_json(&json, &output).await?;

    println!("Imported {} into {}", json.display(), output.display());
    println!(
        "  {} items: {} done, {} failed, {} pending; next item {}",
        summary.total, summary.done, summary.failed, summary.pending, summary.cursor
    );
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Backup(args) => run_transfers(args, Direction::Backup).await,
        Command::Restore(args) => run_transfers(args, Direction::Restore).await,
        Command::Status(args) => run_status(args).await,
        Command::ImportJson(args) => run_import_json(args).await,
    }
}
