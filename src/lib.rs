//! # doc2rows
//!
//! Turn scanned documents into structured rows using a vision extraction
//! service.
//!
//! ## Why this crate?
//!
//! Table data trapped in scans, photos and PDFs does not come out of
//! traditional text extraction in usable shape: cell boundaries, headers and
//! reading order are lost. Instead this crate rasterises every page into a
//! PNG and hands it to a vision extraction service together with a column
//! spec, getting back typed-by-key rows per page. Around that one call it
//! provides the batch machinery a real ingestion UI needs: incremental
//! conversion, page selection, a bounded retrying worker pool, resumable
//! state and progress reporting.
//!
//! ## Pipeline Overview
//!
//! ```text
//! sources (PDF / PNG / JPEG)
//!  │
//!  ├─ 1. Convert  rasterise pages via pdfium (CPU-bound, spawn_blocking),
//!  │              stream page events in order, full raster + thumbnail
//!  ├─ 2. Select   PageStore: flag pages for schema and for extraction
//!  ├─ 3. Extract  ItemStore + ExtractionRunner: 5 concurrent service
//!  │              calls, 3 attempts each with 1s/2s backoff
//!  ├─ 4. Persist  debounced RunRecord writes, resumable after restart
//!  └─ 5. Export   completed rows in item order + Progress counts
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use doc2rows::{
//!     collect_pages, ColumnSpec, ExtractionRunner, HttpExtractor, ItemStore,
//!     PipelineConfig, SourceInput,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let sources = vec![SourceInput::from_path("invoices.pdf")?];
//!
//!     // 1. Convert every page.
//!     let mut collected = collect_pages(sources, &config, CancellationToken::new()).await;
//!     for page in &mut collected.pages {
//!         page.selected_for_extraction = true;
//!     }
//!
//!     // 2. Extract rows from the selected pages.
//!     let columns = ColumnSpec::from_display_names(&["Description", "Qty", "Unit Price"])?;
//!     let selected: Vec<&_> = collected.pages.iter().collect();
//!     let items = Arc::new(ItemStore::from_pages(&selected));
//!     let extractor = Arc::new(HttpExtractor::new("https://extract.example.com/v1/rows")?);
//!     let runner = ExtractionRunner::new(items.clone(), extractor, config);
//!
//!     let outcome = runner.run(&columns).await?;
//!     eprintln!("{} completed, {} failed", outcome.completed, outcome.failed);
//!     for row in items.completed_rows() {
//!         println!("{row:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doc2rows` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! doc2rows = { version = "0.2", default-features = false }
//! ```
//!
//! ## Cancellation model
//!
//! Conversion and extraction both take a [`tokio_util::sync::CancellationToken`]
//! style of cancellation and treat it as a normal outcome, not an error. A
//! cancelled conversion ends its stream after the page in flight; a cancelled
//! run lets in-flight service calls finish, leaves untouched items pending,
//! and reports `canceled = true` in its [`RunOutcome`]. Calling
//! [`ExtractionRunner::run`] again picks up exactly where the cancel left off.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod items;
pub mod pipeline;
pub mod progress;
pub mod runner;
pub mod service;
pub mod storage;
pub mod store;
pub mod testing;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use convert::{
    collect_pages, convert_sources, inspect_source, CollectedPages, PageEventStream, SourceSummary,
};
pub use error::{ConvertError, Doc2RowsError, ItemError, ServiceError, StorageError};
pub use items::ItemStore;
pub use progress::{ConvertProgress, NoopConvertProgress, Progress, ProgressCallback};
pub use runner::{ExtractionRunner, RunOutcome};
pub use service::{ExtractOutput, Extractor, HttpExtractor};
pub use storage::{
    DebouncedRecordWriter, HttpObjectStore, JsonFileRecordStore, MemoryRecordStore, ObjectStore,
    RecordStore, RunRecord,
};
pub use store::PageStore;
pub use types::{
    Column, ColumnSpec, ExtractionItem, ItemStatus, PageEvent, PageUnit, RasterPayload, Row,
    SourceFile, SourceInput, SourceKind, StorageRef,
};
