//! The page store: every converted page, in arrival order, with its two
//! selection flags.
//!
//! A single owner mutates the store (`&mut self` everywhere); shared
//! observers get snapshots or borrowed slices. Pages keep their original
//! `seq` for life, removal included, so "page 3 of invoice.pdf" always
//! names the same page.

use crate::types::{PageEvent, PageUnit};
use uuid::Uuid;

/// Append-only list of converted pages with per-page selection flags.
#[derive(Debug, Default)]
pub struct PageStore {
    pages: Vec<PageUnit>,
}

impl PageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a page. Pages arrive in conversion order and keep that order.
    pub fn add_page(&mut self, page: PageUnit) {
        self.pages.push(page);
    }

    /// Append the page carried by a converter event.
    pub fn add_event(&mut self, event: PageEvent) {
        self.add_page(event.unit);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> &[PageUnit] {
        &self.pages
    }

    pub fn page(&self, id: Uuid) -> Option<&PageUnit> {
        self.pages.iter().find(|p| p.id == id)
    }

    // ── Selection ─────────────────────────────────────────────────────────

    /// Set the schema-inference flag. Returns false when the id is unknown.
    pub fn set_schema_selected(&mut self, id: Uuid, selected: bool) -> bool {
        match self.pages.iter_mut().find(|p| p.id == id) {
            Some(p) => {
                p.selected_for_schema = selected;
                true
            }
            None => false,
        }
    }

    /// Set the extraction flag. Returns false when the id is unknown.
    pub fn set_extraction_selected(&mut self, id: Uuid, selected: bool) -> bool {
        match self.pages.iter_mut().find(|p| p.id == id) {
            Some(p) => {
                p.selected_for_extraction = selected;
                true
            }
            None => false,
        }
    }

    /// Flip the schema-inference flag, returning the new value.
    pub fn toggle_schema(&mut self, id: Uuid) -> Option<bool> {
        self.pages.iter_mut().find(|p| p.id == id).map(|p| {
            p.selected_for_schema = !p.selected_for_schema;
            p.selected_for_schema
        })
    }

    /// Flip the extraction flag, returning the new value.
    pub fn toggle_extraction(&mut self, id: Uuid) -> Option<bool> {
        self.pages.iter_mut().find(|p| p.id == id).map(|p| {
            p.selected_for_extraction = !p.selected_for_extraction;
            p.selected_for_extraction
        })
    }

    /// Select every page for extraction.
    pub fn select_all_for_extraction(&mut self) {
        for p in &mut self.pages {
            p.selected_for_extraction = true;
        }
    }

    /// Clear the extraction flag on every page.
    pub fn clear_extraction_selection(&mut self) {
        for p in &mut self.pages {
            p.selected_for_extraction = false;
        }
    }

    /// Select for extraction every page whose 1-based sequence number falls
    /// in `[from, to]` inclusive, across all sources. Pages outside the
    /// range keep their current flag. Returns how many pages matched; an
    /// inverted range matches none.
    pub fn select_range_for_extraction(&mut self, from: usize, to: usize) -> usize {
        let mut matched = 0;
        for p in &mut self.pages {
            if p.seq >= from && p.seq <= to {
                p.selected_for_extraction = true;
                matched += 1;
            }
        }
        matched
    }

    // ── Views ─────────────────────────────────────────────────────────────

    /// Pages flagged for schema inference, in arrival order.
    pub fn schema_pages(&self) -> Vec<&PageUnit> {
        self.pages.iter().filter(|p| p.selected_for_schema).collect()
    }

    /// Pages flagged for extraction, in arrival order.
    pub fn extraction_pages(&self) -> Vec<&PageUnit> {
        self.pages
            .iter()
            .filter(|p| p.selected_for_extraction)
            .collect()
    }

    /// Pages grouped by source name. Groups appear in the order their
    /// source first produced a page; pages stay in arrival order within
    /// each group.
    pub fn grouped_by_source(&self) -> Vec<(&str, Vec<&PageUnit>)> {
        let mut groups: Vec<(&str, Vec<&PageUnit>)> = Vec::new();
        for page in &self.pages {
            let name = page.source.name.as_str();
            match groups.iter_mut().find(|(n, _)| *n == name) {
                Some((_, pages)) => pages.push(page),
                None => groups.push((name, vec![page])),
            }
        }
        groups
    }

    // ── Removal ───────────────────────────────────────────────────────────

    /// Remove a page. Remaining pages keep their sequence numbers; a
    /// removed page 2 leaves pages 1 and 3 unchanged.
    pub fn remove_page(&mut self, id: Uuid) -> Option<PageUnit> {
        let idx = self.pages.iter().position(|p| p.id == id)?;
        Some(self.pages.remove(idx))
    }

    /// Drop everything.
    pub fn reset(&mut self) {
        self.pages.clear();
    }
}
