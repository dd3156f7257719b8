use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::cli::RunArgs;
use crate::transfer::{Prefixes, DEFAULT_RATE_LIMIT_MARKERS};
use crate::types::Direction;

/// Settings for a backup or restore run.
pub struct Config {
    pub tracker: PathBuf,
    pub log_dir: PathBuf,
    pub rclone: PathBuf,
    pub remote_name: String,
    /// Normalized: empty, or ending in `/`.
    pub destination: String,
    pub sources: Vec<String>,
    pub rate_limit_markers: Vec<String>,
    pub verbosity: u8,
    pub direction: Direction,
    pub retry_failed: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("direction", &self.direction)
            .field("tracker", &self.tracker)
            .field("remote_name", &self.remote_name)
            .field("destination", &self.destination)
            .field("sources", &self.sources)
            .field("retry_failed", &self.retry_failed)
            .finish_non_exhaustive()
    }
}

/// Expand ~ to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Make a non-empty destination end with `/`.
pub(crate) fn normalize_destination(destination: &str) -> String {
    if destination.is_empty() || destination.ends_with('/') {
        destination.to_string()
    } else {
        format!("{destination}/")
    }
}

impl Config {
    pub fn from_cli(args: RunArgs, direction: Direction) -> anyhow::Result<Self> {
        if args.remote_name.trim().is_empty() {
            anyhow::bail!("--remote-name must not be empty");
        }
        if args.remote_name.contains(':') {
            anyhow::bail!(
                "--remote-name '{}' should be the bare remote name, without ':'",
                args.remote_name
            );
        }

        let sources = match direction {
            Direction::Backup => args
                .sources
                .iter()
                .map(|source| {
                    let expanded = expand_tilde(source);
                    if !expanded.is_absolute() {
                        anyhow::bail!("Backup source '{}' must be an absolute path", source);
                    }
                    expanded
                        .to_str()
                        .map(str::to_string)
                        .with_context(|| {
                            format!("Backup source '{}' does not expand to valid UTF-8", source)
                        })
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            Direction::Restore => args.sources,
        };

        let destination = match direction {
            Direction::Backup => normalize_destination(&args.destination),
            Direction::Restore => {
                let expanded = expand_tilde(&args.destination);
                let expanded = expanded.to_str().with_context(|| {
                    format!(
                        "Destination '{}' does not expand to valid UTF-8",
                        args.destination
                    )
                })?;
                normalize_destination(expanded)
            }
        };

        let rate_limit_markers = if args.rate_limit_markers.is_empty() {
            DEFAULT_RATE_LIMIT_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect()
        } else {
            args.rate_limit_markers
        };

        Ok(Self {
            tracker: expand_tilde(&args.tracker),
            log_dir: expand_tilde(&args.logdir),
            rclone: args.rclone,
            remote_name: args.remote_name,
            destination,
            sources,
            rate_limit_markers,
            verbosity: args.verbose,
            direction,
            retry_failed: args.retry_failed,
        })
    }

    /// Transfer prefixes for this run. Backups are namespaced by hostname.
    pub fn prefixes(&self) -> anyhow::Result<Prefixes> {
        let hostname = match self.direction {
            Direction::Backup => local_hostname()?,
            Direction::Restore => String::new(),
        };
        Ok(Prefixes::new(
            self.direction,
            &self.remote_name,
            &self.destination,
            &hostname,
        ))
    }

    pub fn tracker(&self) -> &Path {
        &self.tracker
    }
}

fn local_hostname() -> anyhow::Result<String> {
    let name = hostname::get().context("Cannot determine hostname")?;
    name.into_string()
        .map_err(|raw| anyhow::anyhow!("Hostname {:?} is not valid UTF-8", raw))
}
