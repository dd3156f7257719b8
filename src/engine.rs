//! Resume engine: drives work items through the transfer invoker one at a
//! time, persisting each outcome together with the cursor.
//!
//! The loop checks the shutdown token only between items. An in-flight
//! transfer always runs to completion and its outcome is recorded before
//! the engine stops.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backoff::RateLimitBackoff;
use crate::enumerate::{EnumerationError, Enumerator};
use crate::shutdown::INTERRUPTED_EXIT_CODE;
use crate::state::{ItemOutcome, JobStore, SqliteJobStore, StoreError, WorkItem};
use crate::transfer::{Prefixes, Transfer, TransferOutcome};

/// Errors that abort a run before or outside per-item processing.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Enumeration(#[from] EnumerationError),
}

/// Terminal state of a run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every item is done; the store was moved into the log directory.
    Completed { archived_to: PathBuf },
    /// At least one item failed or is still pending. The store stays in place.
    Failed {
        failures: Vec<WorkItem>,
        unprocessed: u64,
    },
    /// Stopped between items on request.
    Interrupted { cursor: u64 },
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Completed { .. } => 0,
            Self::Failed { .. } => 1,
            Self::Interrupted { .. } => INTERRUPTED_EXIT_CODE,
        }
    }
}

/// Open the store at `tracker`, or enumerate `sources` and create it.
pub async fn prepare_store(
    tracker: &Path,
    sources: &[String],
    enumerator: &dyn Enumerator,
) -> Result<Box<dyn JobStore>, RunError> {
    if tracker.is_file() {
        tracing::info!(
            path = %tracker.display(),
            "Found existing tracker, resuming"
        );
        let store = SqliteJobStore::load(tracker).await?;
        return Ok(Box::new(store));
    }

    tracing::info!(
        path = %tracker.display(),
        sources = ?sources,
        "No tracker found, enumerating sources"
    );
    let paths = enumerator.enumerate(sources).await?;
    tracing::info!(items = paths.len(), "Enumeration complete");
    let store = SqliteJobStore::initialize(tracker, paths).await?;
    Ok(Box::new(store))
}

pub struct ResumeEngine {
    store: Box<dyn JobStore>,
    transfer: Box<dyn Transfer>,
    prefixes: Prefixes,
    backoff: RateLimitBackoff,
    verbosity: u8,
    retry_failed: bool,
    log_dir: PathBuf,
}

impl ResumeEngine {
    pub fn new(
        store: Box<dyn JobStore>,
        transfer: Box<dyn Transfer>,
        prefixes: Prefixes,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            transfer,
            prefixes,
            backoff: RateLimitBackoff::default(),
            verbosity: 0,
            retry_failed: false,
            log_dir,
        }
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Revisit failed items instead of only moving forward from the cursor.
    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    /// Process items until the sequence is exhausted or `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<RunOutcome, RunError> {
        let started = Instant::now();
        let mut cursor = self.store.cursor().await?;
        let mut last_processed: Option<u64> = None;
        let mut attempted = 0u64;
        let mut failed_this_run = 0u64;
        let mut interrupted = false;

        tracing::info!(
            cursor,
            retry_failed = self.retry_failed,
            "Starting transfers"
        );

        loop {
            let item = if self.retry_failed {
                self.store.next_undone_after(last_processed).await?
            } else {
                self.store.work_item(cursor).await?
            };
            let Some(item) = item else {
                break;
            };

            if shutdown.is_cancelled() {
                interrupted = true;
                break;
            }

            let next = self.next_cursor(cursor, item.id).await?;
            last_processed = Some(item.id);

            if item.completed_at.is_some() && item.failure.is_none() {
                tracing::debug!(id = item.id, path = %item.path, "Already done, skipping");
                self.store.set_cursor(next).await?;
                cursor = next;
                continue;
            }

            let outcome = self.attempt(&item, &shutdown).await;
            attempted += 1;
            if outcome.is_failure() {
                failed_this_run += 1;
            }
            self.store.update_work_item(item.id, &outcome, next).await?;
            cursor = next;
        }

        if interrupted {
            tracing::warn!(cursor, attempted, "Interrupted, progress saved");
            return Ok(RunOutcome::Interrupted { cursor });
        }

        self.finish(attempted, failed_this_run, started).await
    }

    /// Cursor to persist once `id` has been processed.
    ///
    /// Default mode moves strictly forward. Retry mode points at the lowest
    /// undone id after `id`, or the end of the sequence, so an interrupted
    /// retry resumes at the items it had not reached yet.
    async fn next_cursor(&self, cursor: u64, id: u64) -> Result<u64, StoreError> {
        if !self.retry_failed {
            return Ok(cursor.max(id + 1));
        }
        match self.store.next_undone_after(Some(id)).await? {
            Some(next) => Ok(next.id),
            None => self.store.total().await,
        }
    }

    /// Run one item's transfer and classify the result.
    async fn attempt(&mut self, item: &WorkItem, shutdown: &CancellationToken) -> ItemOutcome {
        tracing::info!(id = item.id, path = %item.path, "Transferring");
        let source = self.prefixes.source_for(&item.path);
        let dest = self.prefixes.dest_for(&item.path);

        match self.transfer.invoke(&source, &dest, self.verbosity).await {
            TransferOutcome::Success { invocation } => ItemOutcome::Done {
                completed_at: Utc::now(),
                invocation,
            },
            TransferOutcome::Failure {
                reason,
                rate_limited,
                invocation,
            } => {
                tracing::error!(id = item.id, path = %item.path, "Transfer failed: {}", reason.trim_end());
                if rate_limited {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        id = item.id,
                        events = self.backoff.events(),
                        "Rate limited, waiting {}s before continuing",
                        delay.as_secs()
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shutdown.cancelled() => {
                            tracing::info!("Shutdown requested, cutting rate-limit wait short");
                        }
                    }
                }
                ItemOutcome::Failed { reason, invocation }
            }
        }
    }

    /// Decide the terminal state once the loop has run out of items.
    async fn finish(
        self,
        attempted: u64,
        failed_this_run: u64,
        started: Instant,
    ) -> Result<RunOutcome, RunError> {
        let failure_count = self.store.failure_count().await?;
        let unprocessed = self.store.remaining().await?;
        let summary = self.store.summary().await?;

        tracing::info!("── Summary ──");
        tracing::info!(
            "  {} done, {} failed, {} total ({} attempted this run, {} failed)",
            summary.done,
            summary.failed,
            summary.total,
            attempted,
            failed_this_run
        );
        tracing::info!("  elapsed: {:.1?}", started.elapsed());

        if failure_count == 0 && unprocessed == 0 {
            let archived_to = self.store.archive(&self.log_dir).await?;
            tracing::info!(path = %archived_to.display(), "All transfers complete");
            return Ok(RunOutcome::Completed { archived_to });
        }

        let failures = self.store.list_failures().await?;
        tracing::error!("Failures: {}", failures.len());
        for item in &failures {
            tracing::error!(
                id = item.id,
                path = %item.path,
                "{}",
                item.failure.as_deref().unwrap_or_default().trim_end()
            );
        }
        Ok(RunOutcome::Failed {
            failures,
            unprocessed,
        })
    }
}
