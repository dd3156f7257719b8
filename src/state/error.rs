//! Error types for the job store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during job store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A fresh store could not be created. Never layered over stale data.
    #[error("Cannot create job store at {path}: {reason}")]
    Init { path: PathBuf, reason: String },

    /// An existing store is unreadable or lacks the expected layout.
    #[error("Job store at {path} is unreadable or malformed: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A query failed.
    #[error("Database query failed: {0}")]
    Query(String),

    /// A write referenced a work item that does not exist.
    #[error("No work item with id {0}")]
    UnknownItem(u64),

    /// The cursor would point past the end of the item list.
    #[error("Cursor {cursor} is past the end of {len} work items")]
    CursorOutOfRange { cursor: u64, len: u64 },

    /// The store file could not be moved into the log directory.
    #[error("Failed to archive {from} to {to}: {source}")]
    Archive {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn init(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Init {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
