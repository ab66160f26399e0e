//! Source-to-page conversion: the ordered, incremental page stream.
//!
//! ## Why stream?
//!
//! A 200-page scan takes minutes to rasterise. Emitting each page the moment
//! it is ready lets callers fill a page list immediately and start selecting
//! pages while the tail of the batch is still rendering. The stream is lazy:
//! nothing is uploaded or rendered until it is polled.
//!
//! ## Ordering and isolation
//!
//! Sources convert strictly in the order given, and pages within a source in
//! ascending sequence. A source that fails to open or render contributes one
//! `Err` item and conversion moves on to the next source; pages already
//! emitted for the failed source stay valid.
//!
//! ## Cancellation
//!
//! Cancelling the token ends the stream at the next page boundary. That is
//! not an error: whatever was emitted before the cancel is a valid prefix
//! and can be selected and extracted as usual.

use crate::config::PipelineConfig;
use crate::error::ConvertError;
use crate::pipeline::{encode, render};
use crate::progress::{NoopConvertProgress, ProgressCallback};
use crate::storage::upload_best_effort;
use crate::types::{
    PageEvent, PageUnit, RasterPayload, SourceFile, SourceInput, SourceKind, StorageRef,
};
use async_stream::stream;
use futures::stream::StreamExt;
use image::imageops::FilterType;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A boxed stream of page events.
pub type PageEventStream = Pin<Box<dyn Stream<Item = Result<PageEvent, ConvertError>> + Send>>;

/// Convert a batch of sources into a stream of page events.
///
/// Pages arrive in source order, then page order, each carrying a full
/// raster and a thumbnail. Paged documents emit one event per page as
/// rendering progresses; raster images emit exactly one.
///
/// When an object store is configured, each source's original bytes are
/// uploaded before rendering and the resulting [`StorageRef`] is stamped on
/// every page of that source. Upload failures are logged and ignored.
///
/// # Example
/// ```rust,no_run
/// use doc2rows::{convert_sources, PipelineConfig, SourceInput};
/// use futures::StreamExt;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let source = SourceInput::from_path("invoices.pdf")?;
/// let config = PipelineConfig::default();
/// let mut pages = convert_sources(vec![source], &config, CancellationToken::new());
/// while let Some(event) = pages.next().await {
///     match event {
///         Ok(p) => println!("{}: {}x{}", p.unit.label(), p.unit.width(), p.unit.height()),
///         Err(e) => eprintln!("source failed: {e}"),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub fn convert_sources(
    sources: Vec<SourceInput>,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> PageEventStream {
    let config = config.clone();
    let progress: ProgressCallback = config
        .progress
        .clone()
        .unwrap_or_else(|| Arc::new(NoopConvertProgress));

    let s = stream! {
        info!("Converting {} source(s)", sources.len());
        progress.on_conversion_start(sources.len());
        let mut emitted_total = 0usize;

        'sources: for source in sources {
            if cancel.is_cancelled() {
                info!("Conversion cancelled before '{}'", source.name);
                break 'sources;
            }

            let SourceInput { name, kind, bytes } = source;

            // Best-effort archive of the original bytes.
            let storage = match &config.object_store {
                Some(store) => {
                    let key = format!("sources/{}/{}", Uuid::new_v4(), name);
                    upload_best_effort(store.as_ref(), &key, bytes.clone(), content_type_of(&bytes))
                        .await
                        .map(|url| StorageRef { url, key })
                }
                None => None,
            };
            let source_file = SourceFile {
                name,
                kind,
                storage,
            };

            match kind {
                SourceKind::Image => {
                    let max_px = config.max_render_pixels;
                    let thumb_px = config.thumbnail_pixels;
                    let task_name = source_file.name.clone();
                    let decoded = tokio::task::spawn_blocking(move || {
                        decode_image_source(&task_name, &bytes, max_px, thumb_px)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        Err(ConvertError::DecodeFailed {
                            source_name: source_file.name.clone(),
                            detail: format!("decode task failed: {e}"),
                        })
                    });

                    match decoded {
                        Ok((full, thumb)) => {
                            progress.on_source_start(&source_file.name, 1);
                            let unit = PageUnit {
                                id: Uuid::new_v4(),
                                seq: 1,
                                source: source_file,
                                full,
                                thumb,
                                selected_for_schema: false,
                                selected_for_extraction: false,
                            };
                            emitted_total += 1;
                            progress.on_page(&unit.source.name, 1, 1);
                            yield Ok(PageEvent {
                                unit,
                                total_in_source: 1,
                            });
                        }
                        Err(e) => {
                            warn!("'{}': {}", source_file.name, e);
                            progress.on_source_error(&source_file.name, &e.to_string());
                            yield Err(e);
                        }
                    }
                }
                SourceKind::PagedDocument => {
                    let mut rx = render::spawn_paged_render(
                        source_file.name.clone(),
                        bytes,
                        config.password.clone(),
                        config.max_render_pixels,
                        config.thumbnail_pixels,
                        cancel.clone(),
                    );

                    loop {
                        let event = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            ev = rx.recv() => ev,
                        };
                        let Some(event) = event else {
                            if cancel.is_cancelled() {
                                info!("Conversion cancelled during '{}'", source_file.name);
                                break 'sources;
                            }
                            break;
                        };

                        match event {
                            render::RenderEvent::Opened { total_pages } => {
                                progress.on_source_start(&source_file.name, total_pages);
                            }
                            render::RenderEvent::Page(page) => {
                                let rendered = *page;
                                let unit = PageUnit {
                                    id: Uuid::new_v4(),
                                    seq: rendered.seq,
                                    source: source_file.clone(),
                                    full: rendered.full,
                                    thumb: rendered.thumb,
                                    selected_for_schema: false,
                                    selected_for_extraction: false,
                                };
                                emitted_total += 1;
                                progress.on_page(&unit.source.name, rendered.seq, rendered.total);
                                yield Ok(PageEvent {
                                    unit,
                                    total_in_source: rendered.total,
                                });
                            }
                            render::RenderEvent::Failed(e) => {
                                progress.on_source_error(&source_file.name, &e.to_string());
                                yield Err(e);
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Conversion finished: {} page(s) emitted", emitted_total);
        progress.on_conversion_complete(emitted_total);
    };

    Box::pin(s)
}

// ── Collected conversion ─────────────────────────────────────────────────

/// Everything a drained page stream produced.
#[derive(Debug, Default)]
pub struct CollectedPages {
    /// Pages in arrival order (source order, then page order).
    pub pages: Vec<PageUnit>,
    /// One entry per failed source.
    pub errors: Vec<ConvertError>,
    /// Whether the stream ended because the token was cancelled.
    pub canceled: bool,
}

/// Drive [`convert_sources`] to completion and collect the results.
///
/// The convenience wrapper for callers that don't need incremental pages.
pub async fn collect_pages(
    sources: Vec<SourceInput>,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> CollectedPages {
    let mut stream = convert_sources(sources, config, cancel.clone());
    let mut out = CollectedPages::default();
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => out.pages.push(event.unit),
            Err(e) => out.errors.push(e),
        }
    }
    out.canceled = cancel.is_cancelled();
    out
}

// ── Inspection ───────────────────────────────────────────────────────────

/// Cheap metadata about a source, available without converting it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceSummary {
    pub name: String,
    pub kind: SourceKind,
    pub page_count: usize,
    /// First page size: PDF points for paged documents, pixels for images.
    pub first_page_size: Option<(u32, u32)>,
}

/// Report a source's page count and first-page size without rasterising it.
pub async fn inspect_source(
    source: &SourceInput,
    config: &PipelineConfig,
) -> Result<SourceSummary, ConvertError> {
    match source.kind {
        SourceKind::PagedDocument => {
            let name = source.name.clone();
            let bytes = source.bytes.clone();
            let password = config.password.clone();
            let (page_count, first_page_size) = tokio::task::spawn_blocking(move || {
                render::inspect_paged_blocking(&name, bytes, password.as_deref())
            })
            .await
            .map_err(|e| ConvertError::OpenFailed {
                source_name: source.name.clone(),
                detail: format!("inspect task failed: {e}"),
            })??;

            Ok(SourceSummary {
                name: source.name.clone(),
                kind: source.kind,
                page_count,
                first_page_size,
            })
        }
        SourceKind::Image => {
            let decode_failed = |detail: String| ConvertError::DecodeFailed {
                source_name: source.name.clone(),
                detail,
            };
            let reader = image::ImageReader::new(std::io::Cursor::new(&source.bytes))
                .with_guessed_format()
                .map_err(|e| decode_failed(e.to_string()))?;
            let dims = reader
                .into_dimensions()
                .map_err(|e| decode_failed(e.to_string()))?;

            Ok(SourceSummary {
                name: source.name.clone(),
                kind: source.kind,
                page_count: 1,
                first_page_size: Some(dims),
            })
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Decode a raster image source and produce its full + thumbnail payloads.
///
/// Oversized images are downscaled so the longest edge fits `max_pixels`,
/// mirroring what the renderer does for document pages.
fn decode_image_source(
    name: &str,
    bytes: &[u8],
    max_pixels: u32,
    thumb_pixels: u32,
) -> Result<(RasterPayload, RasterPayload), ConvertError> {
    let decode_failed = |detail: String| ConvertError::DecodeFailed {
        source_name: name.to_string(),
        detail,
    };

    let mut img = image::load_from_memory(bytes).map_err(|e| decode_failed(e.to_string()))?;

    if img.width().max(img.height()) > max_pixels {
        debug!(
            "'{}': downscaling {}x{} to fit {} px",
            name,
            img.width(),
            img.height(),
            max_pixels
        );
        img = img.resize(max_pixels, max_pixels, FilterType::Triangle);
    }

    encode::encode_with_thumbnail(&img, thumb_pixels)
        .map_err(|e| decode_failed(format!("PNG encoding failed: {e}")))
}

/// Content type for the object-store upload, from the magic bytes.
fn content_type_of(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"%PDF") {
        "application/pdf"
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ConvertProgress;
    use crate::testing::MemoryObjectStore;
    use image::{Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png_source(name: &str, width: u32, height: u32) -> SourceInput {
        let img = image::DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([40, 90, 200, 255]),
        ));
        let mut buf = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut buf),
            image::ImageFormat::Png,
        )
        .unwrap();
        SourceInput::from_bytes(name, buf).unwrap()
    }

    fn truncated_png_source(name: &str) -> SourceInput {
        let mut bytes = png_source("tmp.png", 8, 8).bytes;
        bytes.truncate(20);
        SourceInput::from_bytes(name, bytes).unwrap()
    }

    #[tokio::test]
    async fn image_source_emits_a_single_page() {
        let config = PipelineConfig::default();
        let out = collect_pages(
            vec![png_source("photo.png", 64, 32)],
            &config,
            CancellationToken::new(),
        )
        .await;

        assert!(out.errors.is_empty());
        assert!(!out.canceled);
        assert_eq!(out.pages.len(), 1);

        let page = &out.pages[0];
        assert_eq!(page.seq, 1);
        assert_eq!(page.source.kind, SourceKind::Image);
        assert_eq!((page.width(), page.height()), (64, 32));
        assert!(page.thumb.width <= 256);
        assert!(!page.selected_for_extraction);
    }

    #[tokio::test]
    async fn oversized_image_is_downscaled() {
        let config = PipelineConfig::builder()
            .max_render_pixels(100)
            .thumbnail_pixels(32)
            .build()
            .unwrap();
        let out = collect_pages(
            vec![png_source("wide.png", 400, 200)],
            &config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(out.pages.len(), 1);
        assert_eq!((out.pages[0].width(), out.pages[0].height()), (100, 50));
    }

    #[tokio::test]
    async fn failed_source_does_not_abort_the_batch() {
        let config = PipelineConfig::default();
        let out = collect_pages(
            vec![
                truncated_png_source("broken.png"),
                png_source("fine.png", 16, 16),
            ],
            &config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(out.errors.len(), 1);
        assert!(matches!(out.errors[0], ConvertError::DecodeFailed { .. }));
        assert_eq!(out.pages.len(), 1);
        assert_eq!(out.pages[0].source.name, "fine.png");
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream_with_a_valid_prefix() {
        let config = PipelineConfig::default();
        let cancel = CancellationToken::new();
        let sources = vec![
            png_source("first.png", 8, 8),
            png_source("second.png", 8, 8),
            png_source("third.png", 8, 8),
        ];

        let mut stream = convert_sources(sources, &config, cancel.clone());
        let first = stream
            .next()
            .await
            .expect("one page before cancel")
            .expect("page ok");
        assert_eq!(first.unit.source.name, "first.png");

        cancel.cancel();
        assert!(stream.next().await.is_none(), "stream ends, no error event");
    }

    #[tokio::test]
    async fn conversion_is_lazy_until_polled() {
        struct StartCounter(AtomicUsize);
        impl ConvertProgress for StartCounter {
            fn on_conversion_start(&self, _total_sources: usize) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(StartCounter(AtomicUsize::new(0)));
        let config = PipelineConfig::builder()
            .progress(counter.clone())
            .build()
            .unwrap();

        let mut stream = convert_sources(
            vec![png_source("a.png", 8, 8)],
            &config,
            CancellationToken::new(),
        );
        assert_eq!(counter.0.load(Ordering::SeqCst), 0, "nothing ran yet");

        let _ = stream.next().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn object_store_ref_is_stamped_on_pages() {
        let store = Arc::new(MemoryObjectStore::new());
        let config = PipelineConfig::builder()
            .object_store(store.clone())
            .build()
            .unwrap();

        let out = collect_pages(
            vec![png_source("scan.png", 8, 8)],
            &config,
            CancellationToken::new(),
        )
        .await;

        let storage = out.pages[0].source.storage.as_ref().expect("uploaded");
        assert!(storage.url.starts_with("memory://sources/"));
        assert!(storage.key.ends_with("/scan.png"));
        assert_eq!(store.keys().len(), 1);
    }

    #[tokio::test]
    async fn upload_failure_only_drops_the_storage_ref() {
        struct RejectingStore;

        #[async_trait::async_trait]
        impl crate::storage::ObjectStore for RejectingStore {
            async fn put(
                &self,
                _key: &str,
                _bytes: Vec<u8>,
                _content_type: &str,
            ) -> Result<String, crate::error::StorageError> {
                Err(crate::error::StorageError::Upload("bucket gone".into()))
            }
        }

        let config = PipelineConfig::builder()
            .object_store(Arc::new(RejectingStore))
            .build()
            .unwrap();

        let out = collect_pages(
            vec![png_source("scan.png", 8, 8)],
            &config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(out.pages.len(), 1);
        assert!(out.pages[0].source.storage.is_none());
    }

    #[tokio::test]
    async fn progress_callback_sees_the_whole_batch() {
        #[derive(Default)]
        struct Tracker {
            pages: AtomicUsize,
            errors: AtomicUsize,
            completed_with: AtomicUsize,
        }
        impl ConvertProgress for Tracker {
            fn on_page(&self, _source_name: &str, _seq: usize, _total: usize) {
                self.pages.fetch_add(1, Ordering::SeqCst);
            }
            fn on_source_error(&self, _source_name: &str, _error: &str) {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
            fn on_conversion_complete(&self, pages_emitted: usize) {
                self.completed_with.store(pages_emitted, Ordering::SeqCst);
            }
        }

        let tracker = Arc::new(Tracker::default());
        let config = PipelineConfig::builder()
            .progress(tracker.clone())
            .build()
            .unwrap();

        let _ = collect_pages(
            vec![
                png_source("a.png", 8, 8),
                truncated_png_source("bad.png"),
                png_source("b.png", 8, 8),
            ],
            &config,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(tracker.pages.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.completed_with.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn inspect_image_reports_pixel_dimensions() {
        let config = PipelineConfig::default();
        let summary = inspect_source(&png_source("photo.png", 40, 20), &config)
            .await
            .unwrap();
        assert_eq!(summary.page_count, 1);
        assert_eq!(summary.first_page_size, Some((40, 20)));
    }

    #[test]
    fn content_type_sniffing() {
        assert_eq!(content_type_of(b"%PDF-1.4"), "application/pdf");
        assert_eq!(
            content_type_of(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
            "image/png"
        );
        assert_eq!(content_type_of(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(content_type_of(b"plain"), "application/octet-stream");
    }
}
