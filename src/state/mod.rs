//! Persistent job store.
//!
//! A single SQLite file holds the ordered work-item list and the progress
//! cursor. Every item outcome is committed together with its cursor advance,
//! so a process killed at any point resumes with at most the in-flight item
//! unrecorded.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{JobStore, SqliteJobStore};
pub use error::StoreError;
pub use types::{Invocation, ItemOutcome, StoreSummary, WorkItem};
