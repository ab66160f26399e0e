//! The extraction runner: a bounded worker pool over the item store.
//!
//! ## Shape of a run
//!
//! One call to [`ExtractionRunner::run`] claims the runner (overlapping
//! runs are refused, not queued), reclaims any stalled `processing` marks
//! left by an aborted run, snapshots the pending ids, and drives them
//! through `buffer_unordered(concurrency)` workers. Each worker claims its
//! item, calls the service with retry, and records the outcome on the item.
//! Item failures stay on their items; the only fatal outcome of a run is a
//! worker panic, surfaced as [`Doc2RowsError::Pipeline`].
//!
//! ## Cancellation and resume
//!
//! [`cancel`](ExtractionRunner::cancel) trips the current run's token.
//! Workers that have not started yet leave their items pending; in-flight
//! service calls finish and record normally. Because every run starts by
//! selecting whatever is pending, calling `run` again afterwards picks up
//! exactly the remainder. A run over zero pending items is a successful
//! no-op, which is what makes re-invocation idempotent.

use crate::config::PipelineConfig;
use crate::error::{Doc2RowsError, ItemError, ServiceError};
use crate::items::ItemStore;
use crate::service::{ExtractOutput, Extractor};
use crate::types::{ColumnSpec, RasterPayload};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a finished run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RunOutcome {
    /// Items that were pending when the run started.
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    /// Items left pending because cancellation arrived before they started.
    pub skipped: usize,
    pub canceled: bool,
    pub duration_ms: u64,
}

impl RunOutcome {
    /// Whether the caller should move forward (show results, advance the
    /// UI). A cancelled run leaves the batch mid-flight; anything else,
    /// failures included, is a settled state worth presenting.
    pub fn should_advance(&self) -> bool {
        !self.canceled
    }
}

/// Drives extraction items through the service under a concurrency limit.
pub struct ExtractionRunner {
    items: Arc<ItemStore>,
    extractor: Arc<dyn Extractor>,
    config: PipelineConfig,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl ExtractionRunner {
    pub fn new(
        items: Arc<ItemStore>,
        extractor: Arc<dyn Extractor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            items,
            extractor,
            config,
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// The shared item store this runner operates on.
    pub fn items(&self) -> &Arc<ItemStore> {
        &self.items
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop starting new work on the active run. In-flight service calls
    /// finish and record their outcomes; not-yet-started items stay
    /// pending. A no-op when no run is active.
    pub fn cancel(&self) {
        self.current_token().cancel();
    }

    /// Process every pending item against the extraction service.
    ///
    /// Returns [`Doc2RowsError::RunInProgress`] when called while another
    /// run on this runner is active. A run with nothing pending returns a
    /// successful zero outcome.
    pub async fn run(&self, columns: &ColumnSpec) -> Result<RunOutcome, Doc2RowsError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Doc2RowsError::RunInProgress);
        }
        let _guard = RunningGuard(&self.running);

        // Fresh token: an earlier cancellation never bleeds into this run.
        let token = self.replace_token();

        let reclaimed = self.items.reclaim_stalled();
        if reclaimed > 0 {
            warn!(
                "Returned {} stalled processing items to pending before run",
                reclaimed
            );
        }

        let started = Instant::now();
        let pending = self.items.pending_ids();
        if pending.is_empty() {
            debug!("Nothing pending, run is a no-op");
            return Ok(RunOutcome {
                dispatched: 0,
                completed: 0,
                failed: 0,
                skipped: 0,
                canceled: false,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let dispatched = pending.len();
        info!(
            "Dispatching {} items ({} concurrent, {} attempts each)",
            dispatched, self.config.concurrency, self.config.max_attempts
        );

        let columns = Arc::new(columns.clone());
        let max_attempts = self.config.max_attempts;
        let backoff_ms = self.config.retry_backoff_ms;

        let drive = async {
            stream::iter(pending.into_iter().map(|id| {
                let items = Arc::clone(&self.items);
                let extractor = Arc::clone(&self.extractor);
                let columns = Arc::clone(&columns);
                let token = token.clone();
                async move {
                    if token.is_cancelled() {
                        return WorkerResult::Skipped;
                    }
                    let Some(dispatch) = items.begin_processing(id) else {
                        return WorkerResult::Skipped;
                    };
                    let raster = match dispatch.raster {
                        Some(r) => r,
                        None => {
                            warn!("{}: no raster payload, failing without dispatch", dispatch.label);
                            items.fail(id, ItemError::MissingRaster);
                            return WorkerResult::Failed;
                        }
                    };

                    match call_with_retry(
                        &extractor,
                        &raster,
                        &columns,
                        max_attempts,
                        backoff_ms,
                        &dispatch.label,
                    )
                    .await
                    {
                        Ok(output) => {
                            debug!("{}: {} rows", dispatch.label, output.rows.len());
                            items.complete(id, output.rows, output.confidence);
                            WorkerResult::Completed
                        }
                        Err(detail) => {
                            items.fail(
                                id,
                                ItemError::ServiceFailed {
                                    attempts: max_attempts,
                                    detail,
                                },
                            );
                            WorkerResult::Failed
                        }
                    }
                }
            }))
            .buffer_unordered(self.config.concurrency)
            .collect::<Vec<WorkerResult>>()
            .await
        };

        let results = AssertUnwindSafe(drive)
            .catch_unwind()
            .await
            .map_err(|payload| Doc2RowsError::Pipeline {
                detail: panic_detail(payload),
            })?;

        let mut outcome = RunOutcome {
            dispatched,
            completed: 0,
            failed: 0,
            skipped: 0,
            canceled: token.is_cancelled(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        for result in results {
            match result {
                WorkerResult::Completed => outcome.completed += 1,
                WorkerResult::Failed => outcome.failed += 1,
                WorkerResult::Skipped => outcome.skipped += 1,
            }
        }

        info!(
            "Run finished: {}/{} completed, {} failed, {} skipped{} in {}ms",
            outcome.completed,
            outcome.dispatched,
            outcome.failed,
            outcome.skipped,
            if outcome.canceled { " (cancelled)" } else { "" },
            outcome.duration_ms
        );
        Ok(outcome)
    }

    /// Move every failed item back to pending, then run.
    pub async fn retry_failed_and_run(
        &self,
        columns: &ColumnSpec,
    ) -> Result<RunOutcome, Doc2RowsError> {
        let moved = self.items.retry_failed();
        debug!("Retrying {} failed items", moved);
        self.run(columns).await
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace_token(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        fresh
    }
}

enum WorkerResult {
    Completed,
    Failed,
    Skipped,
}

/// Resets the running flag when a run ends, panics included.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Call the service up to `max_attempts` times with exponential backoff
/// between attempts (base, 2x base, 4x base, ...). Every error kind is
/// retried the same way; on exhaustion the last error's text is returned.
async fn call_with_retry(
    extractor: &Arc<dyn Extractor>,
    raster: &RasterPayload,
    columns: &ColumnSpec,
    max_attempts: u32,
    backoff_ms: u64,
    label: &str,
) -> Result<ExtractOutput, String> {
    let mut last_err: Option<ServiceError> = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let backoff = backoff_ms * 2u64.pow(attempt - 2);
            warn!(
                "{}: retry {}/{} after {}ms",
                label,
                attempt - 1,
                max_attempts - 1,
                backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match extractor.extract(raster, columns).await {
            Ok(output) => return Ok(output),
            Err(e) => {
                warn!("{}: attempt {} failed: {}", label, attempt, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string()))
}

fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
