//! Error types for the doc2rows library.
//!
//! Failures are split by blast radius:
//!
//! * [`Doc2RowsError`] — **Fatal**: the pipeline as a whole cannot proceed
//!   (invalid configuration, invalid column spec, a second run started while
//!   one is active, a worker panic). Returned as `Err(Doc2RowsError)` from
//!   top-level entry points.
//!
//! * [`ConvertError`] — **Per source**: one input file failed to open, render
//!   or decode. Emitted inside the page stream so conversion of the remaining
//!   sources continues.
//!
//! * [`ItemError`] — **Per item**: one extraction item failed after all
//!   retries. Stored on the item itself, never propagated, so a single bad
//!   page cannot take down a batch.
//!
//! * [`ServiceError`] / [`StorageError`] — failures reported by the external
//!   collaborators (extraction service, object store, record store).
//!
//! Cancellation is not an error anywhere in this crate: a cancelled
//! conversion ends its stream normally and a cancelled run reports
//! `canceled = true` in its [`crate::runner::RunOutcome`].

use thiserror::Error;

/// All fatal errors returned by the doc2rows library.
///
/// Source-level failures use [`ConvertError`] and item-level failures use
/// [`ItemError`]; neither is propagated here.
#[derive(Debug, Error)]
pub enum Doc2RowsError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Column spec validation failed (empty, duplicate or blank keys).
    #[error("Invalid column spec: {0}")]
    InvalidColumns(String),

    // ── Run lifecycle errors ──────────────────────────────────────────────
    /// A run was started while another run on the same runner is active.
    ///
    /// Recoverable: wait for the active run (or cancel it), then call again.
    #[error("An extraction run is already in progress")]
    RunInProgress,

    /// The run loop itself failed (a worker panicked or the pool was torn
    /// down mid-run). Item state is preserved; calling `run` again resumes.
    #[error("Extraction pipeline failed: {detail}")]
    Pipeline { detail: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// Record store read/write failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error scoped to a single source file.
///
/// Emitted as an `Err` item inside the page stream. The stream then moves on
/// to the next source; already-emitted pages of the failed source stay valid.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ConvertError {
    /// No pdfium library could be bound.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    EngineUnavailable(String),

    /// The document could not be opened (corrupt data, wrong password).
    #[error("'{source_name}': cannot open document: {detail}")]
    OpenFailed { source_name: String, detail: String },

    /// Rasterisation of one page failed. Aborts the rest of this source.
    #[error("'{source_name}' page {page}: rasterisation failed: {detail}")]
    RenderFailed {
        source_name: String,
        page: usize,
        detail: String,
    },

    /// A raster image source could not be decoded.
    #[error("'{source_name}': image decode failed: {detail}")]
    DecodeFailed { source_name: String, detail: String },

    /// The source bytes match no supported format.
    #[error("'{source_name}': unsupported format (not a PDF or a known raster image)")]
    Unsupported { source_name: String },
}

/// A non-fatal error for a single extraction item.
///
/// Stored on the [`crate::types::ExtractionItem`] when it enters the `Error`
/// status. The run continues with the remaining items.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ItemError {
    /// The extraction service failed every attempt.
    #[error("extraction failed after {attempts} attempts: {detail}")]
    ServiceFailed { attempts: u32, detail: String },

    /// The item has no raster payload to send (restored from a record that
    /// predates the current session). Fails without calling the service.
    #[error("no raster payload available for this item")]
    MissingRaster,
}

/// Errors reported by the extraction service.
///
/// The runner treats every variant as retryable; after the attempt budget is
/// spent the last one is folded into [`ItemError::ServiceFailed`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Could not reach the service at all.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success HTTP status.
    #[error("service returned HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    /// The call exceeded the configured deadline.
    #[error("service call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The response body did not parse into rows.
    #[error("malformed service response: {0}")]
    MalformedResponse(String),
}

/// Errors from the object store and record store collaborators.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Could not write a record file.
    #[error("failed to write record '{path}': {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Could not read a record file.
    #[error("failed to read record '{path}': {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Record (de)serialisation failed.
    #[error("record serialisation failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// Object upload was rejected or unreachable.
    #[error("object upload failed: {0}")]
    Upload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_failed_display() {
        let e = ConvertError::RenderFailed {
            source_name: "scan.pdf".into(),
            page: 4,
            detail: "bad content stream".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("scan.pdf"), "got: {msg}");
        assert!(msg.contains("page 4"), "got: {msg}");
    }

    #[test]
    fn service_failed_display() {
        let e = ItemError::ServiceFailed {
            attempts: 3,
            detail: "HTTP 503".into(),
        };
        assert!(e.to_string().contains("3 attempts"));
        assert!(e.to_string().contains("HTTP 503"));
    }

    #[test]
    fn run_in_progress_display() {
        let e = Doc2RowsError::RunInProgress;
        assert!(e.to_string().contains("already in progress"));
    }

    #[test]
    fn storage_error_wraps_into_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let e: Doc2RowsError = StorageError::WriteFailed {
            path: "/tmp/run.json".into(),
            source: io,
        }
        .into();
        assert!(e.to_string().contains("/tmp/run.json"));
    }

    #[test]
    fn timeout_display() {
        let e = ServiceError::Timeout { elapsed_ms: 30000 };
        assert!(e.to_string().contains("30000ms"));
    }
}
