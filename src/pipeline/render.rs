//! Paged-document rasterisation: render pages to `DynamicImage` via pdfium.
//!
//! ## Why a blocking thread?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async
//! contexts. Each source is rendered on a `spawn_blocking` thread that owns
//! the open document and hands pages back over a bounded channel, so the
//! async side receives page N while page N+1 is still rendering.
//!
//! ## Why render twice?
//!
//! Full-resolution rasters go to the extraction service; thumbnails feed
//! list views. pdfium scales during rasterisation, so rendering the page a
//! second time at thumbnail size is cheaper and sharper than downscaling
//! the full raster in-process.

use crate::error::ConvertError;
use crate::pipeline::encode;
use crate::types::RasterPayload;
use pdfium_render::prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One rendered page, full raster plus thumbnail, already PNG-encoded.
pub(crate) struct RenderedPage {
    /// 1-based page sequence within the source.
    pub seq: usize,
    pub total: usize,
    pub full: RasterPayload,
    pub thumb: RasterPayload,
}

/// Events a render task sends back to the converter.
pub(crate) enum RenderEvent {
    /// The document opened; page count is known before any page renders.
    Opened { total_pages: usize },
    /// The next page in sequence.
    Page(Box<RenderedPage>),
    /// The source aborted. No further events follow.
    Failed(ConvertError),
}

/// Spawn a blocking render task for one paged document.
///
/// The channel is bounded at one event so rendering cannot outrun the
/// consumer by more than a page. Dropping the receiver stops the task at
/// the next page boundary, as does cancelling the token.
pub(crate) fn spawn_paged_render(
    name: String,
    bytes: Vec<u8>,
    password: Option<String>,
    max_pixels: u32,
    thumb_pixels: u32,
    cancel: CancellationToken,
) -> mpsc::Receiver<RenderEvent> {
    let (tx, rx) = mpsc::channel(1);
    tokio::task::spawn_blocking(move || {
        render_source_blocking(
            &name,
            bytes,
            password.as_deref(),
            max_pixels,
            thumb_pixels,
            &cancel,
            &tx,
        );
    });
    rx
}

/// Blocking render loop for one source. Sends `Opened`, then pages in
/// order, then either finishes or sends one `Failed`.
fn render_source_blocking(
    name: &str,
    bytes: Vec<u8>,
    password: Option<&str>,
    max_pixels: u32,
    thumb_pixels: u32,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<RenderEvent>,
) {
    let pdfium = match bind_engine() {
        Ok(p) => p,
        Err(e) => {
            let _ = tx.blocking_send(RenderEvent::Failed(e));
            return;
        }
    };

    let document = match pdfium.load_pdf_from_byte_vec(bytes, password) {
        Ok(doc) => doc,
        Err(e) => {
            let detail = describe_open_error(&e, password.is_some());
            let _ = tx.blocking_send(RenderEvent::Failed(ConvertError::OpenFailed {
                source_name: name.to_string(),
                detail,
            }));
            return;
        }
    };

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("'{}' opened: {} pages", name, total_pages);

    if tx
        .blocking_send(RenderEvent::Opened { total_pages })
        .is_err()
    {
        return;
    }

    let full_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);
    let thumb_config = PdfRenderConfig::new()
        .set_target_width(thumb_pixels as i32)
        .set_maximum_height(thumb_pixels as i32);

    for seq in 1..=total_pages {
        if cancel.is_cancelled() {
            debug!("'{}': render cancelled before page {}", name, seq);
            return;
        }

        let rendered = render_one_page(name, &pages, seq, &full_config, &thumb_config);
        let event = match rendered {
            Ok(page) => RenderEvent::Page(Box::new(RenderedPage {
                seq,
                total: total_pages,
                full: page.0,
                thumb: page.1,
            })),
            Err(e) => {
                warn!("'{}' page {}: {}", name, seq, e);
                let _ = tx.blocking_send(RenderEvent::Failed(e));
                return;
            }
        };

        // blocking_send returns Err only when the receiver is gone
        if tx.blocking_send(event).is_err() {
            debug!("'{}': consumer dropped, stopping render", name);
            return;
        }
    }
}

/// Render one page at both sizes and PNG-encode the results.
fn render_one_page(
    name: &str,
    pages: &PdfPages<'_>,
    seq: usize,
    full_config: &PdfRenderConfig,
    thumb_config: &PdfRenderConfig,
) -> Result<(RasterPayload, RasterPayload), ConvertError> {
    let render_failed = |detail: String| ConvertError::RenderFailed {
        source_name: name.to_string(),
        page: seq,
        detail,
    };

    let page = pages
        .get((seq - 1) as u16)
        .map_err(|e| render_failed(format!("{e:?}")))?;

    let full_bitmap = page
        .render_with_config(full_config)
        .map_err(|e| render_failed(format!("{e:?}")))?;
    let full_image = full_bitmap.as_image();

    let thumb_bitmap = page
        .render_with_config(thumb_config)
        .map_err(|e| render_failed(format!("{e:?}")))?;
    let thumb_image = thumb_bitmap.as_image();

    debug!(
        "'{}' page {} rendered: {}x{} px (thumb {}x{})",
        name,
        seq,
        full_image.width(),
        full_image.height(),
        thumb_image.width(),
        thumb_image.height()
    );

    let full = encode::encode_raster(&full_image)
        .map_err(|e| render_failed(format!("PNG encoding failed: {e}")))?;
    let thumb = encode::encode_raster(&thumb_image)
        .map_err(|e| render_failed(format!("PNG encoding failed: {e}")))?;

    Ok((full, thumb))
}

/// Open a paged document just far enough to report its page count and the
/// size of its first page (in PDF points, rounded).
pub(crate) fn inspect_paged_blocking(
    name: &str,
    bytes: Vec<u8>,
    password: Option<&str>,
) -> Result<(usize, Option<(u32, u32)>), ConvertError> {
    let pdfium = bind_engine()?;
    let document = pdfium
        .load_pdf_from_byte_vec(bytes, password)
        .map_err(|e| ConvertError::OpenFailed {
            source_name: name.to_string(),
            detail: describe_open_error(&e, password.is_some()),
        })?;

    let pages = document.pages();
    let page_count = pages.len() as usize;
    let first_page_size = pages.first().ok().map(|page| {
        (
            page.width().value.round() as u32,
            page.height().value.round() as u32,
        )
    });
    Ok((page_count, first_page_size))
}

/// Bind to a pdfium library: `PDFIUM_LIB_PATH` when set, else the platform
/// library name in the working directory, else the system library.
fn bind_engine() -> Result<Pdfium, ConvertError> {
    let library_path = std::env::var("PDFIUM_LIB_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| Pdfium::pdfium_platform_library_name_at_path("./"));

    let bindings = Pdfium::bind_to_library(&library_path)
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| ConvertError::EngineUnavailable(format!("{e:?}")))?;

    Ok(Pdfium::new(bindings))
}

/// Turn a pdfium open error into a caller-actionable message.
fn describe_open_error(err: &PdfiumError, password_given: bool) -> String {
    let raw = format!("{err:?}");
    if raw.contains("Password") || raw.contains("password") {
        if password_given {
            "wrong password".to_string()
        } else {
            "document is encrypted and requires a password".to_string()
        }
    } else {
        raw
    }
}
