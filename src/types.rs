//! Core data model: sources, pages, columns, rows, extraction items.
//!
//! Everything downstream of conversion speaks in these types. A source file
//! becomes one or more [`PageUnit`]s; the extraction-selected pages become
//! [`ExtractionItem`]s; the service turns each item's raster into [`Row`]s
//! keyed by the [`ColumnSpec`].

use crate::error::{ConvertError, Doc2RowsError, ItemError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ── Sources ──────────────────────────────────────────────────────────────

/// What kind of document a source file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A single raster image (PNG or JPEG). Always exactly one page.
    Image,
    /// A paged document (PDF). One page unit per document page.
    PagedDocument,
}

/// Sniff the source kind from the first bytes of the file.
///
/// `%PDF` marks a paged document; PNG and JPEG signatures mark a raster
/// image. Anything else is unsupported.
pub(crate) fn sniff_kind(bytes: &[u8]) -> Option<SourceKind> {
    if bytes.len() >= 4 && &bytes[..4] == b"%PDF" {
        return Some(SourceKind::PagedDocument);
    }
    if bytes.len() >= 8 && bytes[..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some(SourceKind::Image);
    }
    if bytes.len() >= 3 && bytes[..3] == [0xFF, 0xD8, 0xFF] {
        return Some(SourceKind::Image);
    }
    None
}

/// An input file queued for conversion: display name, sniffed kind, and the
/// raw bytes. Documents are loaded from memory, so the library never needs
/// the original file to stay on disk.
#[derive(Debug, Clone)]
pub struct SourceInput {
    pub name: String,
    pub kind: SourceKind,
    pub bytes: Vec<u8>,
}

impl SourceInput {
    /// Build a source from in-memory bytes, sniffing the kind from the
    /// leading magic bytes.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Result<Self, ConvertError> {
        let name = name.into();
        let kind = sniff_kind(&bytes).ok_or(ConvertError::Unsupported {
            source_name: name.clone(),
        })?;
        Ok(Self { name, kind, bytes })
    }

    /// Read a file from disk and sniff its kind.
    ///
    /// The display name is the file name portion of the path.
    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self, ConvertError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let bytes = std::fs::read(path).map_err(|e| ConvertError::OpenFailed {
            source_name: name.clone(),
            detail: e.to_string(),
        })?;
        Self::from_bytes(name, bytes)
    }
}

/// Where an uploaded copy of a source file lives, when the best-effort
/// upload succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRef {
    pub url: String,
    pub key: String,
}

/// Metadata of a converted source, attached to every page unit it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub kind: SourceKind,
    /// `None` when no object store is configured or the upload failed.
    pub storage: Option<StorageRef>,
}

// ── Rasters and pages ────────────────────────────────────────────────────

/// An encoded PNG raster with its pixel dimensions.
///
/// This is the currency the extraction service accepts, so pages carry their
/// rasters pre-encoded instead of as decoded pixel buffers.
#[derive(Debug, Clone)]
pub struct RasterPayload {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RasterPayload {
    /// Base64 of the PNG bytes, for JSON request bodies.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.png)
    }

    pub fn len(&self) -> usize {
        self.png.len()
    }

    pub fn is_empty(&self) -> bool {
        self.png.is_empty()
    }
}

/// One page of a converted source.
///
/// `seq` is 1-based and strictly increasing per source with no gaps: a
/// cancelled conversion yields a valid prefix, never a page N+1 without N.
/// The two selection flags are independent; a page may be selected for
/// schema inference, for extraction, for both, or for neither.
#[derive(Debug, Clone)]
pub struct PageUnit {
    pub id: Uuid,
    /// 1-based position within the source document.
    pub seq: usize,
    pub source: SourceFile,
    /// Full-resolution raster, sent to the extraction service.
    pub full: RasterPayload,
    /// Small raster for list views.
    pub thumb: RasterPayload,
    pub selected_for_schema: bool,
    pub selected_for_extraction: bool,
}

impl PageUnit {
    pub fn width(&self) -> u32 {
        self.full.width
    }

    pub fn height(&self) -> u32 {
        self.full.height
    }

    /// Short label for logs, e.g. `invoice.pdf p3`.
    pub fn label(&self) -> String {
        format!("{} p{}", self.source.name, self.seq)
    }
}

/// What the converter emits for each page: the unit plus how many pages its
/// source has in total (known up front, so callers can show `3 / 12` while
/// page 4 is still rendering).
#[derive(Debug, Clone)]
pub struct PageEvent {
    pub unit: PageUnit,
    pub total_in_source: usize,
}

// ── Columns and rows ─────────────────────────────────────────────────────

static KEY_SANITISER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// One column of the extraction schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Human-facing header, e.g. `"Invoice №"`.
    pub display_name: String,
    /// Stable machine key, e.g. `"invoice"`. Unique within the spec.
    pub key: String,
}

/// An ordered, validated set of columns.
///
/// Keys are non-empty and unique; both are enforced at construction so the
/// rest of the pipeline can index rows by key without checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    columns: Vec<Column>,
}

impl ColumnSpec {
    /// Validate and wrap an explicit column list.
    pub fn new(columns: Vec<Column>) -> Result<Self, Doc2RowsError> {
        if columns.is_empty() {
            return Err(Doc2RowsError::InvalidColumns(
                "at least one column is required".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for col in &columns {
            if col.key.trim().is_empty() {
                return Err(Doc2RowsError::InvalidColumns(format!(
                    "column '{}' has an empty key",
                    col.display_name
                )));
            }
            if !seen.insert(col.key.as_str()) {
                return Err(Doc2RowsError::InvalidColumns(format!(
                    "duplicate column key '{}'",
                    col.key
                )));
            }
        }
        Ok(Self { columns })
    }

    /// Build a spec from display names, deriving normalised keys.
    ///
    /// Normalisation: lowercase, runs of non-alphanumerics collapse to `_`,
    /// leading/trailing `_` trimmed. Collisions get `_2`, `_3`, ... suffixes
    /// so the result is always valid.
    pub fn from_display_names<S: AsRef<str>>(names: &[S]) -> Result<Self, Doc2RowsError> {
        if names.is_empty() {
            return Err(Doc2RowsError::InvalidColumns(
                "at least one column is required".into(),
            ));
        }
        let mut used = std::collections::HashSet::new();
        let columns = names
            .iter()
            .map(|name| {
                let display_name = name.as_ref().to_string();
                let base = normalise_key(&display_name);
                let mut key = base.clone();
                let mut n = 2;
                while !used.insert(key.clone()) {
                    key = format!("{base}_{n}");
                    n += 1;
                }
                Column { display_name, key }
            })
            .collect();
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Derive a machine key from a display name.
fn normalise_key(display_name: &str) -> String {
    let lowered = display_name.to_lowercase();
    let key = KEY_SANITISER
        .replace_all(&lowered, "_")
        .trim_matches('_')
        .to_string();
    if key.is_empty() {
        "col".to_string()
    } else {
        key
    }
}

/// One extracted record: column key to cell value.
///
/// Cells are strings as delivered by the service; typing and validation are
/// the caller's concern.
pub type Row = BTreeMap<String, String>;

// ── Extraction items ─────────────────────────────────────────────────────

/// Lifecycle of an extraction item.
///
/// Legal transitions: `Pending -> Processing -> Completed | Error` and
/// `Error -> Pending` (retry). Enforced by [`crate::items::ItemStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// One unit of extraction work: a page raster plus the state of its trip
/// through the service.
///
/// The raster is not serialised; an item restored from a record carries
/// `raster: None` and fails with [`ItemError::MissingRaster`] if dispatched
/// without re-attaching a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionItem {
    pub id: Uuid,
    /// Page this item was built from, when built in this session.
    pub page_id: Option<Uuid>,
    pub source_name: String,
    /// 1-based page sequence within the source, for labels and export.
    pub page_seq: usize,
    #[serde(skip)]
    pub raster: Option<RasterPayload>,
    pub status: ItemStatus,
    pub rows: Vec<Row>,
    pub confidence: Option<f32>,
    pub error: Option<ItemError>,
}

impl ExtractionItem {
    /// A fresh pending item for a page.
    pub fn from_page(page: &PageUnit) -> Self {
        Self {
            id: Uuid::new_v4(),
            page_id: Some(page.id),
            source_name: page.source.name.clone(),
            page_seq: page.seq,
            raster: Some(page.full.clone()),
            status: ItemStatus::Pending,
            rows: Vec::new(),
            confidence: None,
            error: None,
        }
    }

    /// Short label for logs, e.g. `invoice.pdf p3`.
    pub fn label(&self) -> String {
        format!("{} p{}", self.source_name, self.page_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_pdf_and_rasters() {
        assert_eq!(sniff_kind(b"%PDF-1.7\n"), Some(SourceKind::PagedDocument));
        assert_eq!(
            sniff_kind(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00]),
            Some(SourceKind::Image)
        );
        assert_eq!(sniff_kind(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(SourceKind::Image));
        assert_eq!(sniff_kind(b"hello world"), None);
        assert_eq!(sniff_kind(b""), None);
    }

    #[test]
    fn from_bytes_rejects_unknown_magic() {
        let err = SourceInput::from_bytes("notes.txt", b"just text".to_vec()).unwrap_err();
        assert!(matches!(err, ConvertError::Unsupported { .. }));
    }

    #[test]
    fn normalise_key_basic() {
        assert_eq!(normalise_key("Invoice Number"), "invoice_number");
        assert_eq!(normalise_key("  Total ($)  "), "total");
        assert_eq!(normalise_key("Qty."), "qty");
        assert_eq!(normalise_key("___"), "col");
        assert_eq!(normalise_key(""), "col");
    }

    #[test]
    fn from_display_names_dedupes_with_suffixes() {
        let spec = ColumnSpec::from_display_names(&["Total", "total!", "TOTAL"]).unwrap();
        let keys: Vec<&str> = spec.keys().collect();
        assert_eq!(keys, vec!["total", "total_2", "total_3"]);
    }

    #[test]
    fn new_rejects_duplicate_keys() {
        let cols = vec![
            Column {
                display_name: "A".into(),
                key: "a".into(),
            },
            Column {
                display_name: "Also A".into(),
                key: "a".into(),
            },
        ];
        let err = ColumnSpec::new(cols).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn new_rejects_empty_key_and_empty_spec() {
        let err = ColumnSpec::new(vec![Column {
            display_name: "Blank".into(),
            key: "  ".into(),
        }])
        .unwrap_err();
        assert!(err.to_string().contains("empty key"));

        assert!(ColumnSpec::new(vec![]).is_err());
        assert!(ColumnSpec::from_display_names::<&str>(&[]).is_err());
    }

    #[test]
    fn item_serialisation_drops_raster() {
        let item = ExtractionItem {
            id: Uuid::new_v4(),
            page_id: None,
            source_name: "scan.png".into(),
            page_seq: 1,
            raster: Some(RasterPayload {
                png: vec![1, 2, 3],
                width: 10,
                height: 10,
            }),
            status: ItemStatus::Completed,
            rows: vec![Row::from([("a".to_string(), "1".to_string())])],
            confidence: Some(0.9),
            error: None,
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(!json.contains("raster"));

        let back: ExtractionItem = serde_json::from_str(&json).unwrap();
        assert!(back.raster.is_none());
        assert_eq!(back.status, ItemStatus::Completed);
        assert_eq!(back.rows.len(), 1);
    }
}
