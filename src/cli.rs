use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "rclone-tracker",
    version,
    about = "Resumable directory-by-directory rclone backups and restores"
)]
pub struct Cli {
    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy local directories to the remote, resuming any unfinished run
    Backup(RunArgs),

    /// Copy remote directories back to local disk, resuming any unfinished run
    Restore(RunArgs),

    /// Show progress of an existing tracker
    Status(StatusArgs),

    /// Convert a JSON tracker from older releases into a SQLite tracker
    ImportJson(ImportArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Progress tracking database used to resume after interruption
    #[arg(short = 't', long, default_value = "rclone_tracker.db")]
    pub tracker: String,

    /// Name of the remote in your rclone config
    #[arg(short = 'r', long)]
    pub remote_name: String,

    /// Backup: bucket/path on the remote. Restore: local directory to restore into
    #[arg(short = 'd', long, default_value = "")]
    pub destination: String,

    /// Top-level paths to transfer (absolute local paths for backup,
    /// remote paths for restore)
    #[arg(short = 's', long, num_args = 1.., required = true)]
    pub sources: Vec<String>,

    /// Verbosity passed through to rclone; -vv and above also records
    /// command output in the tracker
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory in which to keep completed trackers
    #[arg(short = 'l', long, default_value = "logs")]
    pub logdir: String,

    /// Re-attempt previously failed items instead of only continuing forward
    #[arg(long)]
    pub retry_failed: bool,

    /// rclone executable
    #[arg(long, default_value = "rclone")]
    pub rclone: PathBuf,

    /// Text in rclone's stderr that marks a rate-limited failure
    /// (repeatable; replaces the built-in list)
    #[arg(long = "rate-limit-marker")]
    pub rate_limit_markers: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Progress tracking database to inspect
    #[arg(short = 't', long, default_value = "rclone_tracker.db")]
    pub tracker: String,

    /// List every failed item with its failure text
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    /// JSON tracker to convert
    pub json: String,

    /// Output database (default: the JSON path with a .db extension)
    #[arg(short = 'o', long)]
    pub output: Option<String>,
}
