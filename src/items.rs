//! The item store: every extraction item and its trip through the service.
//!
//! Shared as `Arc<ItemStore>` between the runner's workers and read-only
//! observers (progress polling, export, persistence snapshots). All writes
//! go through methods that enforce the status transitions
//! `pending -> processing -> completed | error` and `error -> pending`, so
//! no two workers can claim the same item and no code path can complete an
//! item that was never dispatched.

use crate::error::ItemError;
use crate::progress::Progress;
use crate::types::{ExtractionItem, ItemStatus, PageUnit, RasterPayload, Row};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// What a worker receives when it claims an item.
pub struct Dispatch {
    /// `None` for items restored without a payload; the worker fails these
    /// with [`ItemError::MissingRaster`] instead of calling the service.
    pub raster: Option<RasterPayload>,
    /// Log label, e.g. `invoice.pdf p3`.
    pub label: String,
}

/// Thread-safe collection of [`ExtractionItem`]s with enforced transitions.
#[derive(Default)]
pub struct ItemStore {
    items: Mutex<Vec<ExtractionItem>>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build pending items from pages (callers pass the extraction-selected
    /// subset).
    pub fn from_pages(pages: &[&PageUnit]) -> Self {
        let items = pages.iter().map(|p| ExtractionItem::from_page(p)).collect();
        Self {
            items: Mutex::new(items),
        }
    }

    /// Rebuild from persisted items, e.g. a loaded
    /// [`crate::storage::RunRecord`].
    pub fn restore(items: Vec<ExtractionItem>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    /// Add a pending item for every page that has none yet (matched by page
    /// id). Existing items, completed ones included, are left alone.
    /// Returns how many items were added.
    pub fn ensure_items_for(&self, pages: &[&PageUnit]) -> usize {
        let mut items = self.lock();
        let mut added = 0;
        for page in pages {
            if !items.iter().any(|i| i.page_id == Some(page.id)) {
                items.push(ExtractionItem::from_page(page));
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Clone of one item.
    pub fn item(&self, id: Uuid) -> Option<ExtractionItem> {
        self.lock().iter().find(|i| i.id == id).cloned()
    }

    /// Clone of every item, in arrival order.
    pub fn snapshot(&self) -> Vec<ExtractionItem> {
        self.lock().clone()
    }

    /// Ids of all pending items, in arrival order.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.lock()
            .iter()
            .filter(|i| i.status == ItemStatus::Pending)
            .map(|i| i.id)
            .collect()
    }

    // ── Transitions ───────────────────────────────────────────────────────

    /// Claim a pending item: `pending -> processing`. Returns `None` when
    /// the item is unknown or not pending, so a second claimer backs off.
    pub fn begin_processing(&self, id: Uuid) -> Option<Dispatch> {
        let mut items = self.lock();
        let item = items
            .iter_mut()
            .find(|i| i.id == id && i.status == ItemStatus::Pending)?;
        item.status = ItemStatus::Processing;
        Some(Dispatch {
            raster: item.raster.clone(),
            label: item.label(),
        })
    }

    /// `processing -> completed`, storing the extracted rows. Returns false
    /// when the item was not processing.
    pub fn complete(&self, id: Uuid, rows: Vec<Row>, confidence: Option<f32>) -> bool {
        let mut items = self.lock();
        match items
            .iter_mut()
            .find(|i| i.id == id && i.status == ItemStatus::Processing)
        {
            Some(item) => {
                item.status = ItemStatus::Completed;
                item.rows = rows;
                item.confidence = confidence;
                item.error = None;
                true
            }
            None => false,
        }
    }

    /// `processing -> error`, storing the failure. Returns false when the
    /// item was not processing.
    pub fn fail(&self, id: Uuid, error: ItemError) -> bool {
        let mut items = self.lock();
        match items
            .iter_mut()
            .find(|i| i.id == id && i.status == ItemStatus::Processing)
        {
            Some(item) => {
                item.status = ItemStatus::Error;
                item.error = Some(error);
                true
            }
            None => false,
        }
    }

    /// `error -> pending` for one item. Returns false when the item was not
    /// in error.
    pub fn retry_item(&self, id: Uuid) -> bool {
        let mut items = self.lock();
        match items
            .iter_mut()
            .find(|i| i.id == id && i.status == ItemStatus::Error)
        {
            Some(item) => {
                item.status = ItemStatus::Pending;
                item.error = None;
                true
            }
            None => false,
        }
    }

    /// `error -> pending` for every failed item. Returns how many moved.
    pub fn retry_failed(&self) -> usize {
        let mut items = self.lock();
        let mut moved = 0;
        for item in items.iter_mut() {
            if item.status == ItemStatus::Error {
                item.status = ItemStatus::Pending;
                item.error = None;
                moved += 1;
            }
        }
        moved
    }

    /// `processing -> pending` sweep. Only valid while no run is active: a
    /// processing mark with no live worker is a leftover from an aborted
    /// run. Returns how many items were reclaimed.
    pub fn reclaim_stalled(&self) -> usize {
        let mut items = self.lock();
        let mut reclaimed = 0;
        for item in items.iter_mut() {
            if item.status == ItemStatus::Processing {
                item.status = ItemStatus::Pending;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!("Reclaimed {} stalled processing items", reclaimed);
        }
        reclaimed
    }

    // ── Edits and views ───────────────────────────────────────────────────

    /// Overwrite one cell of one completed item's row. The write is scoped
    /// to (item, row, key), so completions of sibling items can never
    /// clobber it. Returns false when the item, row or status don't match.
    pub fn apply_correction(&self, id: Uuid, row: usize, key: &str, value: &str) -> bool {
        let mut items = self.lock();
        match items
            .iter_mut()
            .find(|i| i.id == id && i.status == ItemStatus::Completed)
        {
            Some(item) => match item.rows.get_mut(row) {
                Some(r) => {
                    r.insert(key.to_string(), value.to_string());
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Aggregate progress over all items.
    pub fn progress(&self) -> Progress {
        Progress::from_statuses(self.lock().iter().map(|i| i.status))
    }

    /// All rows of all completed items, flattened in item order. Valid at
    /// any time; mid-run it simply exports what has finished so far.
    pub fn completed_rows(&self) -> Vec<Row> {
        self.lock()
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .flat_map(|i| i.rows.iter().cloned())
            .collect()
    }

    /// Drop everything.
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ExtractionItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}
