//! One-shot conversion of the older whole-file JSON tracker into a SQLite
//! store.
//!
//! The JSON layout is `{"next": n, "sources": {"0": {"path": ..., "done": ...,
//! "failure": ...}, ...}}`. Item keys are decimal ids and must be dense from 0.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::state::types::parse_timestamp;
use crate::state::{Invocation, JobStore, SqliteJobStore, StoreError, StoreSummary, WorkItem};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not a valid JSON tracker: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Source key {0:?} is not a numeric id")]
    BadKey(String),

    #[error("Source ids are not contiguous: expected {expected}, found {found}")]
    Gap { expected: u64, found: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct LegacyTracker {
    #[serde(default)]
    next: u64,
    #[serde(default)]
    sources: BTreeMap<String, LegacySource>,
}

#[derive(Debug, Deserialize)]
struct LegacySource {
    path: String,
    done: Option<String>,
    failure: Option<String>,
    args: Option<Vec<String>>,
    command_line: Option<String>,
    returncode: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
}

impl LegacySource {
    fn into_work_item(self, id: u64) -> WorkItem {
        let invocation = match (self.args, self.command_line) {
            (None, None) => None,
            (args, command_line) => Some(Invocation {
                args: args.unwrap_or_default(),
                command_line: command_line.unwrap_or_default(),
                returncode: self.returncode,
                stdout: self.stdout.unwrap_or_default(),
                stderr: self.stderr.unwrap_or_default(),
            }),
        };
        WorkItem {
            id,
            path: self.path,
            completed_at: self.done.as_deref().map(parse_timestamp),
            invocation,
            failure: self.failure,
        }
    }
}

/// Default output location: the JSON path with a `.db` extension.
pub fn default_output(json: &Path) -> PathBuf {
    json.with_extension("db")
}

fn parse_tracker(raw: &[u8], path: &Path) -> Result<(Vec<WorkItem>, u64), ImportError> {
    let tracker: LegacyTracker =
        serde_json::from_slice(raw).map_err(|source| ImportError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let mut keyed = tracker
        .sources
        .into_iter()
        .map(|(key, source)| {
            key.trim()
                .parse::<u64>()
                .map(|id| (id, source))
                .map_err(|_| ImportError::BadKey(key))
        })
        .collect::<Result<Vec<_>, _>>()?;
    // String keys sort lexically ("10" < "2"); order numerically.
    keyed.sort_by_key(|(id, _)| *id);

    let items = keyed
        .into_iter()
        .enumerate()
        .map(|(expected, (id, source))| {
            let expected = expected as u64;
            if id != expected {
                return Err(ImportError::Gap {
                    expected,
                    found: id,
                });
            }
            Ok(source.into_work_item(id))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((items, tracker.next))
}

/// Convert `json` into a new store at `output`. Fails if `output` exists.
pub async fn import_json(json: &Path, output: &Path) -> Result<StoreSummary, ImportError> {
    let raw = tokio::fs::read(json)
        .await
        .map_err(|source| ImportError::Read {
            path: json.to_path_buf(),
            source,
        })?;
    let (items, cursor) = parse_tracker(&raw, json)?;
    tracing::info!(
        path = %json.display(),
        items = items.len(),
        cursor,
        "Parsed JSON tracker"
    );

    let store = SqliteJobStore::initialize_with(output, items, cursor).await?;
    let summary = store.summary().await?;
    tracing::info!(path = %output.display(), "Wrote SQLite tracker");
    Ok(summary)
}
