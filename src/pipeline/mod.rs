//! Pipeline stages for document-to-page conversion.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. switch rendering backend) without touching
//! other stages.
//!
//! ## Data Flow
//!
//! ```text
//! source bytes ──▶ render ──▶ encode ──▶ PageUnit
//! (PDF / image)    (pdfium)   (PNG + thumb)
//! ```
//!
//! 1. [`render`] — rasterise paged documents page by page; runs on a
//!    blocking thread because pdfium is not async-safe
//! 2. [`encode`] — PNG-encode each raster at full and thumbnail size

pub mod encode;
pub mod render;
