//! Expanding top-level sources into an ordered list of work items.
//!
//! Both strategies order items leaf-to-root so every directory is
//! transferred after all of its descendants.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::decode::decode_output;

/// Errors that abort enumeration. No partial list is ever returned.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Listing {path} exited with status {code:?}: {stderr}")]
    Listing {
        path: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Listing {path} returned malformed output: {source}")]
    Malformed {
        path: String,
        source: serde_json::Error,
    },

    #[error("{} is not valid UTF-8 and cannot be passed to rclone", path.display())]
    NonUtf8Path { path: PathBuf },

    #[error("Directory walk task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Strategy that expands one top-level source into work-item paths.
#[async_trait]
pub trait Enumerator: Send + Sync {
    /// Paths for a single source, in processing order.
    async fn enumerate_source(&self, source: &str) -> Result<Vec<String>, EnumerationError>;

    /// Paths for all sources, concatenated in input order.
    async fn enumerate(&self, sources: &[String]) -> Result<Vec<String>, EnumerationError> {
        let mut paths = Vec::new();
        for source in sources {
            let expanded = self.enumerate_source(source).await?;
            tracing::debug!(source = %source, items = expanded.len(), "Enumerated source");
            paths.extend(expanded);
        }
        Ok(paths)
    }
}

/// Walks local directory trees (backup direction).
#[derive(Debug, Clone, Default)]
pub struct LocalEnumerator;

#[async_trait]
impl Enumerator for LocalEnumerator {
    async fn enumerate_source(&self, source: &str) -> Result<Vec<String>, EnumerationError> {
        let source = source.to_string();
        tokio::task::spawn_blocking(move || walk_post_order(&source)).await?
    }
}

/// Every descendant directory of `source` in post-order, then `source`.
///
/// Symlinks are not followed and not emitted. Unreadable entries are
/// skipped with a warning. A directory name that is not UTF-8 aborts the
/// walk, since it cannot be stored or handed to rclone intact.
fn walk_post_order(source: &str) -> Result<Vec<String>, EnumerationError> {
    let mut paths = Vec::new();
    let walker = WalkDir::new(source)
        .follow_links(false)
        .contents_first(true)
        .min_depth(1)
        .sort_by_file_name();

    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => {
                match entry.into_path().into_os_string().into_string() {
                    Ok(path) => paths.push(path),
                    Err(raw) => {
                        return Err(EnumerationError::NonUtf8Path {
                            path: PathBuf::from(raw),
                        })
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(source, error = %e, "Skipping unreadable entry");
            }
        }
    }

    paths.push(source.to_string());
    Ok(paths)
}

/// One entry of `rclone lsjson` output. Other fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ListEntry {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "IsDir")]
    pub is_dir: bool,
}

/// Lists remote trees with `rclone lsjson` (restore direction).
#[derive(Debug, Clone)]
pub struct RemoteEnumerator {
    program: PathBuf,
    remote_name: String,
}

impl RemoteEnumerator {
    pub fn new(program: impl Into<PathBuf>, remote_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            remote_name: remote_name.into(),
        }
    }

    async fn list(&self, source: &str) -> Result<Vec<ListEntry>, EnumerationError> {
        let target = format!("{}:{}", self.remote_name, source);
        tracing::debug!(target = %target, "Listing remote");

        let output = Command::new(&self.program)
            .args(["lsjson", "--recursive", &target])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| EnumerationError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(EnumerationError::Listing {
                path: target,
                code: output.status.code(),
                stderr: decode_output(&output.stderr),
            });
        }

        parse_listing(&output.stdout).map_err(|source| EnumerationError::Malformed {
            path: target,
            source,
        })
    }
}

#[async_trait]
impl Enumerator for RemoteEnumerator {
    async fn enumerate_source(&self, source: &str) -> Result<Vec<String>, EnumerationError> {
        let source = with_trailing_slash(source);
        let entries = self.list(&source).await?;
        Ok(remote_items(&source, &entries))
    }
}

/// Parse `rclone lsjson` stdout.
pub fn parse_listing(stdout: &[u8]) -> Result<Vec<ListEntry>, serde_json::Error> {
    serde_json::from_slice(stdout)
}

/// Build the ordered item list for one remote source.
///
/// `source` must end with `/`. Directories come first, the source itself
/// last; the result is then stably sorted deepest-first by `/` count.
pub fn remote_items(source: &str, entries: &[ListEntry]) -> Vec<String> {
    let mut items: Vec<String> = entries
        .iter()
        .filter(|entry| entry.is_dir)
        .map(|entry| format!("{source}{}", entry.path))
        .collect();
    items.push(source.to_string());
    items.sort_by_key(|path| std::cmp::Reverse(path.matches('/').count()));
    items
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}
