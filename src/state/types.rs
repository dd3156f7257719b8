//! Types for the job store.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Status of a work item, derived from its recorded fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Not yet attempted, or interrupted before its outcome was recorded.
    Pending,
    /// Transfer finished successfully.
    Done,
    /// Last attempt failed; eligible for retry.
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Details of one external tool invocation, kept only at elevated verbosity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Full argument vector, program name first.
    pub args: Vec<String>,
    /// Shell-quoted rendering of `args`.
    pub command_line: String,
    /// Exit code, `None` if the process was killed by a signal.
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// One granular transfer unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Dense, zero-based position in processing order.
    pub id: u64,
    /// Local or remote path this item addresses.
    pub path: String,
    /// When the transfer succeeded.
    pub completed_at: Option<DateTime<Utc>>,
    /// Command detail of the last attempt, if captured.
    pub invocation: Option<Invocation>,
    /// Decoded stderr of the last failed attempt.
    pub failure: Option<String>,
}

impl WorkItem {
    /// A fresh item that has never been attempted.
    pub fn pending(id: u64, path: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            completed_at: None,
            invocation: None,
            failure: None,
        }
    }

    pub fn status(&self) -> ItemStatus {
        match (&self.completed_at, &self.failure) {
            (_, Some(_)) => ItemStatus::Failed,
            (Some(_), None) => ItemStatus::Done,
            (None, None) => ItemStatus::Pending,
        }
    }
}

/// Result of a single attempt, written together with the cursor advance.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Done {
        completed_at: DateTime<Utc>,
        invocation: Option<Invocation>,
    },
    Failed {
        reason: String,
        invocation: Option<Invocation>,
    },
}

impl ItemOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Aggregate view of a store, used by the `status` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSummary {
    pub total: u64,
    pub done: u64,
    pub failed: u64,
    pub pending: u64,
    pub cursor: u64,
}

/// Render a completion timestamp the way it is stored in the `done` column.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored completion timestamp.
///
/// Accepts RFC 3339 as well as the naive ISO form written by the earlier
/// tracker (`2021-03-04T05:06:07.123456`, implicitly UTC). Anything else is
/// still a completion marker, so it maps to the epoch rather than `None`.
pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Utc.from_utc_datetime(&naive);
    }
    tracing::warn!(raw, "Unrecognised completion timestamp, treating as epoch");
    DateTime::UNIX_EPOCH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derivation() {
        let mut item = WorkItem::pending(0, "/data");
        assert_eq!(item.status(), ItemStatus::Pending);

        item.completed_at = Some(Utc::now());
        assert_eq!(item.status(), ItemStatus::Done);

        item.completed_at = None;
        item.failure = Some("boom".into());
        assert_eq!(item.status(), ItemStatus::Failed);
    }

    #[test]
    fn test_failure_wins_over_stale_completion() {
        let mut item = WorkItem::pending(3, "/data");
        item.completed_at = Some(Utc::now());
        item.failure = Some("late failure".into());
        assert_eq!(item.status(), ItemStatus::Failed);
    }

    #[test]
    fn test_parse_rfc3339_timestamp() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(&now));
        assert_eq!(parsed, now);
    }

    #[test]
    fn test_parse_legacy_naive_timestamp() {
        let parsed = parse_timestamp("2021-03-04T05:06:07.123456");
        assert_eq!(parsed.to_rfc3339(), "2021-03-04T05:06:07.123456+00:00");
    }

    #[test]
    fn test_parse_garbage_timestamp_is_still_done() {
        assert_eq!(parse_timestamp("yesterday"), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_outcome_is_failure() {
        let done = ItemOutcome::Done {
            completed_at: Utc::now(),
            invocation: None,
        };
        let failed = ItemOutcome::Failed {
            reason: "x".into(),
            invocation: None,
        };
        assert!(!done.is_failure());
        assert!(failed.is_failure());
    }
}
