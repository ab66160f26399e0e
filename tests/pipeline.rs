//! Integration tests for the full pipeline, driven by the mock extractor.
//!
//! Everything here runs hermetically: raster-image sources exercise the real
//! converter, and hand-built pages with marker rasters exercise selection,
//! extraction, cancellation and persistence against `MockExtractor`. No
//! pdfium library, network or live service is needed.
//!
//! Run with:
//!   cargo test --test pipeline

use doc2rows::testing::{marker_raster, MemoryObjectStore, MockExtractor};
use doc2rows::{
    collect_pages, ColumnSpec, Doc2RowsError, ExtractOutput, ExtractionRunner, Extractor,
    ItemError, ItemStatus, ItemStore, JsonFileRecordStore, PageStore, PageUnit, PipelineConfig,
    RasterPayload, RecordStore, Row, RunRecord, ServiceError, SourceFile, SourceInput, SourceKind,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn columns() -> ColumnSpec {
    ColumnSpec::from_display_names(&["Description", "Amount"]).unwrap()
}

fn row(description: &str, amount: &str) -> Row {
    Row::from([
        ("description".to_string(), description.to_string()),
        ("amount".to_string(), amount.to_string()),
    ])
}

/// A page whose rasters are a marker tag, for scripting the mock per page.
fn marker_page(source: &str, seq: usize, tag: &str) -> PageUnit {
    PageUnit {
        id: Uuid::new_v4(),
        seq,
        source: SourceFile {
            name: source.to_string(),
            kind: SourceKind::PagedDocument,
            storage: None,
        },
        full: marker_raster(tag),
        thumb: marker_raster(tag),
        selected_for_schema: false,
        selected_for_extraction: false,
    }
}

fn store_from(pages: &[PageUnit]) -> Arc<ItemStore> {
    let refs: Vec<&PageUnit> = pages.iter().collect();
    Arc::new(ItemStore::from_pages(&refs))
}

fn png_source(name: &str, width: u32, height: u32) -> SourceInput {
    let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
        width,
        height,
        image::Rgba([10, 120, 60, 255]),
    ));
    let mut buf = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    SourceInput::from_bytes(name, buf).unwrap()
}

// ── Conversion to extraction, end to end ─────────────────────────────────────

#[tokio::test]
async fn images_convert_select_and_extract_to_rows() {
    let store = Arc::new(MemoryObjectStore::new());
    let config = PipelineConfig::builder()
        .object_store(store.clone())
        .build()
        .unwrap();

    let collected = collect_pages(
        vec![png_source("a.png", 32, 32), png_source("b.png", 32, 32)],
        &config,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(collected.pages.len(), 2);
    assert!(collected.errors.is_empty());
    assert_eq!(store.keys().len(), 2, "both sources archived");

    let mut pages = PageStore::new();
    for page in collected.pages {
        pages.add_page(page);
    }
    pages.select_all_for_extraction();

    let items = Arc::new(ItemStore::from_pages(&pages.extraction_pages()));
    let mock = MockExtractor::new(vec![row("Widget", "9.50")]).with_confidence(0.9);
    let runner = ExtractionRunner::new(Arc::clone(&items), Arc::new(mock), config);

    let outcome = runner.run(&columns()).await.unwrap();
    assert_eq!(outcome.dispatched, 2);
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 0);
    assert!(!outcome.canceled);

    let progress = items.progress();
    assert_eq!(progress.percent, 100.0);
    assert!(progress.is_settled());

    let rows = items.completed_rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["description"], "Widget");
    assert_eq!(items.snapshot()[0].confidence, Some(0.9));
}

// ── Ordering ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn exported_rows_follow_page_order_not_completion_order() {
    let pages = vec![
        marker_page("a.pdf", 1, "a1"),
        marker_page("a.pdf", 2, "a2"),
        marker_page("b.pdf", 1, "b1"),
    ];
    let items = store_from(&pages);

    let labels: Vec<String> = items.snapshot().iter().map(|i| i.label()).collect();
    assert_eq!(labels, vec!["a.pdf p1", "a.pdf p2", "b.pdf p1"]);

    // Distinct rows per page; concurrent completion order is irrelevant.
    let mock = MockExtractor::new(vec![row("default", "0")])
        .with_rows_for("a1", vec![row("first", "1")])
        .with_rows_for("a2", vec![row("second", "2")])
        .with_rows_for("b1", vec![row("third", "3")])
        .with_delay(Duration::from_millis(20));
    let runner = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::default(),
    );
    runner.run(&columns()).await.unwrap();

    let descriptions: Vec<String> = items
        .completed_rows()
        .iter()
        .map(|r| r["description"].clone())
        .collect();
    assert_eq!(descriptions, vec!["first", "second", "third"]);
}

// ── Retry and failure isolation ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn two_failures_then_success_backs_off_one_then_two_seconds() {
    let pages = vec![marker_page("a.pdf", 1, "flaky")];
    let items = store_from(&pages);
    let mock = MockExtractor::new(vec![row("ok", "1")]).failing_times("flaky", 2);
    let calls = mock.call_count_handle();
    let runner = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::default(),
    );

    let started = tokio::time::Instant::now();
    let outcome = runner.run(&columns()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.completed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(
        elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4),
        "1s + 2s backoff expected, took {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn attempts_stop_at_the_configured_budget() {
    let pages = vec![marker_page("a.pdf", 1, "dead")];
    let items = store_from(&pages);
    let mock = MockExtractor::new(vec![]).always_failing("dead");
    let calls = mock.call_count_handle();
    let runner = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::default(),
    );

    let outcome = runner.run(&columns()).await.unwrap();
    assert_eq!(outcome.failed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3, "1 call + 2 retries");

    let item = &items.snapshot()[0];
    assert_eq!(item.status, ItemStatus::Error);
    match &item.error {
        Some(ItemError::ServiceFailed { attempts, detail }) => {
            assert_eq!(*attempts, 3);
            assert!(detail.contains("503"), "last error kept: {detail}");
        }
        other => panic!("expected ServiceFailed, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn one_bad_page_does_not_take_down_the_batch() {
    let pages = vec![
        marker_page("a.pdf", 1, "good1"),
        marker_page("a.pdf", 2, "bad"),
        marker_page("a.pdf", 3, "good2"),
    ];
    let items = store_from(&pages);
    let mock = MockExtractor::new(vec![row("ok", "1")]).always_failing("bad");
    let runner = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::default(),
    );

    let outcome = runner.run(&columns()).await.unwrap();
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 1);

    let progress = items.progress();
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.error, 1);
    assert_eq!(progress.percent, 67.0);
}

#[tokio::test(start_paused = true)]
async fn retry_failed_reruns_only_errored_items() {
    let pages = vec![
        marker_page("a.pdf", 1, "ok"),
        marker_page("a.pdf", 2, "flaky"),
    ];
    let items = store_from(&pages);
    // Fails 3 times: the whole first attempt budget, then succeeds on retry.
    let mock = MockExtractor::new(vec![row("ok", "1")]).failing_times("flaky", 3);
    let calls = mock.call_count_handle();
    let runner = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::default(),
    );

    let first = runner.run(&columns()).await.unwrap();
    assert_eq!((first.completed, first.failed), (1, 1));
    let after_first = calls.load(Ordering::SeqCst);
    assert_eq!(after_first, 4, "1 for the good page, 3 for the flaky one");

    let second = runner.retry_failed_and_run(&columns()).await.unwrap();
    assert_eq!(second.dispatched, 1, "completed item is not re-sent");
    assert_eq!(second.completed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), after_first + 1);
    assert_eq!(items.progress().percent, 100.0);
}

// ── Concurrency and cancellation ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn in_flight_calls_never_exceed_the_concurrency_limit() {
    let pages: Vec<PageUnit> = (1..=8)
        .map(|seq| marker_page("big.pdf", seq, &format!("p{seq}")))
        .collect();
    let items = store_from(&pages);
    let mock = MockExtractor::new(vec![row("ok", "1")]).with_delay(Duration::from_millis(50));
    let max_in_flight = mock.max_in_flight_handle();
    let runner = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::builder().concurrency(5).build().unwrap(),
    );

    let outcome = runner.run(&columns()).await.unwrap();
    assert_eq!(outcome.completed, 8);
    assert_eq!(
        max_in_flight.load(Ordering::SeqCst),
        5,
        "pool saturates at, and never exceeds, the limit"
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_finishes_in_flight_items_and_leaves_the_rest_pending() {
    let pages: Vec<PageUnit> = (1..=6)
        .map(|seq| marker_page("big.pdf", seq, &format!("p{seq}")))
        .collect();
    let items = store_from(&pages);
    let mock = MockExtractor::new(vec![row("ok", "1")]).with_delay(Duration::from_millis(100));
    let calls = mock.call_count_handle();
    let runner = Arc::new(ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::builder().concurrency(2).build().unwrap(),
    ));

    let handle = {
        let runner = Arc::clone(&runner);
        let columns = columns();
        tokio::spawn(async move { runner.run(&columns).await })
    };

    // Let the first two workers claim their items, then cancel.
    tokio::time::sleep(Duration::from_millis(10)).await;
    runner.cancel();

    let outcome = handle.await.unwrap().unwrap();
    assert!(outcome.canceled);
    assert!(!outcome.should_advance());
    assert_eq!(outcome.completed, 2, "in-flight items finish and record");
    assert_eq!(outcome.skipped, 4, "unstarted items are left alone");
    assert_eq!(outcome.failed, 0, "cancellation is not an error");

    let progress = items.progress();
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.pending, 4);

    // Resume: a fresh run picks up exactly the remainder.
    let resumed = runner.run(&columns()).await.unwrap();
    assert_eq!(resumed.dispatched, 4);
    assert_eq!(resumed.completed, 4);
    assert_eq!(
        calls.load(Ordering::SeqCst),
        6,
        "no item is ever sent to the service twice"
    );
    assert_eq!(items.progress().percent, 100.0);
}

// ── Run lifecycle ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn overlapping_runs_are_refused_not_queued() {
    let pages = vec![marker_page("a.pdf", 1, "slow")];
    let items = store_from(&pages);
    let mock = MockExtractor::new(vec![row("ok", "1")]).with_delay(Duration::from_millis(100));
    let runner = Arc::new(ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::default(),
    ));

    let handle = {
        let runner = Arc::clone(&runner);
        let columns = columns();
        tokio::spawn(async move { runner.run(&columns).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(runner.is_running());
    let err = runner.run(&columns()).await.unwrap_err();
    assert!(matches!(err, Doc2RowsError::RunInProgress));

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.completed, 1);
    assert!(!runner.is_running());
}

#[tokio::test]
async fn rerunning_a_settled_batch_is_a_noop() {
    let pages = vec![marker_page("a.pdf", 1, "p1")];
    let items = store_from(&pages);
    let mock = MockExtractor::new(vec![row("ok", "1")]);
    let calls = mock.call_count_handle();
    let runner = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::default(),
    );

    runner.run(&columns()).await.unwrap();
    let again = runner.run(&columns()).await.unwrap();
    assert_eq!(again.dispatched, 0);
    assert_eq!(again.completed, 0);
    assert!(!again.canceled);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "completed work is not redone");
}

#[tokio::test]
async fn worker_panic_is_a_pipeline_error_and_the_batch_recovers() {
    struct PanickingExtractor;

    #[async_trait::async_trait]
    impl Extractor for PanickingExtractor {
        async fn extract(
            &self,
            _raster: &RasterPayload,
            _columns: &ColumnSpec,
        ) -> Result<ExtractOutput, ServiceError> {
            panic!("simulated worker crash");
        }
    }

    let pages = vec![
        marker_page("a.pdf", 1, "p1"),
        marker_page("a.pdf", 2, "p2"),
        marker_page("a.pdf", 3, "p3"),
    ];
    let items = store_from(&pages);
    let broken = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(PanickingExtractor),
        PipelineConfig::default(),
    );

    let err = broken.run(&columns()).await.unwrap_err();
    assert!(matches!(err, Doc2RowsError::Pipeline { .. }));
    assert!(err.to_string().contains("simulated worker crash"));
    assert!(!broken.is_running(), "the running flag is released on panic");
    assert_eq!(items.progress().processing, 1, "the claimed item is stranded");

    // Same store, working service: the stranded item is reclaimed and the
    // whole batch settles.
    let fixed = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(MockExtractor::new(vec![row("ok", "1")])),
        PipelineConfig::default(),
    );
    let outcome = fixed.run(&columns()).await.unwrap();
    assert_eq!(outcome.dispatched, 3);
    assert_eq!(outcome.completed, 3);
    assert_eq!(items.progress().percent, 100.0);
}

// ── Selection ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn range_selection_extracts_only_the_matching_sequences() {
    let mut pages = PageStore::new();
    for seq in 1..=4 {
        pages.add_page(marker_page("a.pdf", seq, &format!("a{seq}")));
    }
    for seq in 1..=2 {
        pages.add_page(marker_page("b.pdf", seq, &format!("b{seq}")));
    }

    // Range is per-source sequence, applied across every source.
    let selected = pages.select_range_for_extraction(2, 3);
    assert_eq!(selected, 3, "a.pdf p2, p3 and b.pdf p2");

    let items = Arc::new(ItemStore::from_pages(&pages.extraction_pages()));
    let mock = MockExtractor::new(vec![row("ok", "1")]);
    let runner = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::default(),
    );
    let outcome = runner.run(&columns()).await.unwrap();
    assert_eq!(outcome.completed, 3);

    let labels: Vec<String> = items.snapshot().iter().map(|i| i.label()).collect();
    assert_eq!(labels, vec!["a.pdf p2", "a.pdf p3", "b.pdf p2"]);
}

#[tokio::test]
async fn removing_a_page_before_extraction_keeps_the_others_intact() {
    let mut pages = PageStore::new();
    for seq in 1..=3 {
        pages.add_page(marker_page("a.pdf", seq, &format!("a{seq}")));
    }
    let middle = pages.pages()[1].id;
    let removed = pages.remove_page(middle).expect("page existed");
    assert_eq!(removed.seq, 2);

    pages.select_all_for_extraction();
    let items = Arc::new(ItemStore::from_pages(&pages.extraction_pages()));
    let labels: Vec<String> = items.snapshot().iter().map(|i| i.label()).collect();
    // Sequences are not renumbered; the gap stays visible.
    assert_eq!(labels, vec!["a.pdf p1", "a.pdf p3"]);
}

// ── Corrections and export ───────────────────────────────────────────────────

#[tokio::test]
async fn corrections_edit_completed_rows_in_place() {
    let pages = vec![marker_page("a.pdf", 1, "p1")];
    let items = store_from(&pages);
    let mock = MockExtractor::new(vec![row("Widgut", "9.99"), row("Bolt", "0.40")]);
    let runner = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::default(),
    );
    runner.run(&columns()).await.unwrap();

    let id = items.snapshot()[0].id;
    assert!(items.apply_correction(id, 0, "description", "Widget"));
    assert!(!items.apply_correction(id, 5, "description", "x"), "row index checked");

    let rows = items.completed_rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["description"], "Widget");
    assert_eq!(rows[1]["description"], "Bolt");
}

// ── Persistence ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn record_round_trip_restores_state_but_not_rasters() {
    let pages = vec![
        marker_page("a.pdf", 1, "done"),
        marker_page("a.pdf", 2, "broken"),
    ];
    let items = store_from(&pages);
    let mock = MockExtractor::new(vec![row("ok", "1")]).always_failing("broken");
    let runner = ExtractionRunner::new(
        Arc::clone(&items),
        Arc::new(mock),
        PipelineConfig::default(),
    );
    runner.run(&columns()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileRecordStore::new(dir.path().join("run.json"));
    store
        .save(&RunRecord::new(Some(columns()), items.snapshot()))
        .await
        .unwrap();

    // A later session loads the record.
    let loaded = store.load().await.unwrap().expect("record present");
    assert_eq!(loaded.columns, Some(columns()));
    let restored = Arc::new(ItemStore::restore(loaded.items));

    let progress = restored.progress();
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.error, 1);
    let rows = restored.completed_rows();
    assert_eq!(rows[0]["description"], "ok", "extracted rows survive the trip");

    // Rasters are session-local: retrying the failed item without one fails
    // fast instead of calling the service.
    assert_eq!(restored.retry_failed(), 1);
    let mock = MockExtractor::new(vec![row("ok", "1")]);
    let calls = mock.call_count_handle();
    let rerun = ExtractionRunner::new(
        Arc::clone(&restored),
        Arc::new(mock),
        PipelineConfig::default(),
    );
    let outcome = rerun.run(&columns()).await.unwrap();
    assert_eq!(outcome.failed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no raster, no service call");
    assert!(matches!(
        restored.snapshot()[1].error,
        Some(ItemError::MissingRaster)
    ));
}
