//! Progress reporting: batch-level aggregation and per-page callbacks.
//!
//! Two different consumers need two different shapes:
//!
//! * [`Progress`] is a stateless aggregate over item statuses, recomputed on
//!   demand. Nothing caches it, so it can never drift from the item list.
//! * [`ConvertProgress`] is a callback trait the converter invokes per page,
//!   for progress bars and UIs that want events rather than polling.
//!
//! # Example
//!
//! ```rust
//! use doc2rows::{ConvertProgress, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     pages: AtomicUsize,
//! }
//!
//! impl ConvertProgress for CountingCallback {
//!     fn on_page(&self, source_name: &str, seq: usize, total: usize) {
//!         self.pages.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{source_name}: page {seq}/{total}");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress(Arc::new(CountingCallback { pages: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::types::ItemStatus;
use std::sync::Arc;

/// Aggregate counts over a batch of extraction items.
///
/// `percent` is completed over total, rounded to the nearest whole number.
/// An empty batch reports 0%, not NaN.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Progress {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
    pub total: usize,
    pub percent: f64,
}

impl Progress {
    /// Compute progress from a pass over item statuses.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ItemStatus>,
    {
        let mut p = Self {
            pending: 0,
            processing: 0,
            completed: 0,
            error: 0,
            total: 0,
            percent: 0.0,
        };
        for status in statuses {
            p.total += 1;
            match status {
                ItemStatus::Pending => p.pending += 1,
                ItemStatus::Processing => p.processing += 1,
                ItemStatus::Completed => p.completed += 1,
                ItemStatus::Error => p.error += 1,
            }
        }
        if p.total > 0 {
            p.percent = (p.completed as f64 / p.total as f64 * 100.0).round();
        }
        p
    }

    /// True when every item reached a terminal status.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// Called by the converter as it emits pages.
///
/// Implementations must be `Send + Sync`; the converter may invoke methods
/// from a blocking render thread. All methods have default no-op
/// implementations so callers only override what they care about.
pub trait ConvertProgress: Send + Sync {
    /// Called once before the first source is opened.
    fn on_conversion_start(&self, total_sources: usize) {
        let _ = total_sources;
    }

    /// Called when a source has been opened and its page count is known.
    fn on_source_start(&self, source_name: &str, total_pages: usize) {
        let _ = (source_name, total_pages);
    }

    /// Called after each page is rendered and emitted.
    ///
    /// `seq` is the 1-based page sequence, `total` the page count of the
    /// source being converted.
    fn on_page(&self, source_name: &str, seq: usize, total: usize) {
        let _ = (source_name, seq, total);
    }

    /// Called when a source aborts with an error. Remaining sources still
    /// convert.
    fn on_source_error(&self, source_name: &str, error: &str) {
        let _ = (source_name, error);
    }

    /// Called once when the stream ends, whether it ran to completion or
    /// was cancelled.
    fn on_conversion_complete(&self, pages_emitted: usize) {
        let _ = pages_emitted;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopConvertProgress;

impl ConvertProgress for NoopConvertProgress {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn ConvertProgress>;
