//! CLI binary for doc2rows.
//!
//! A thin shim over the library crate: convert the given sources, select
//! pages, run extraction against the configured service, and print rows.

use anyhow::{Context, Result};
use clap::Parser;
use doc2rows::{
    collect_pages, inspect_source, ColumnSpec, ConvertProgress, DebouncedRecordWriter,
    ExtractionItem, ExtractionRunner, HttpExtractor, HttpObjectStore, ItemStore,
    JsonFileRecordStore, PageStore, PipelineConfig, Progress, RecordStore, Row, RunOutcome,
    RunRecord, SourceInput,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

/// Truncate to `max` characters on a char boundary, with an ellipsis.
fn shorten(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}\u{2026}")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress for the conversion phase. The bar's length grows as
/// sources are opened, since page counts are only known per source.
struct CliProgress {
    bar: ProgressBar,
    activated: AtomicBool,
    errors: AtomicUsize,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            activated: AtomicBool::new(false),
            errors: AtomicUsize::new(0),
        })
    }

    /// Switch from spinner to a counting bar once the first source opens.
    fn activate(&self) {
        if self.activated.swap(true, Ordering::SeqCst) {
            return;
        }
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} pages  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        self.bar.set_style(style);
        self.bar.set_prefix("Converting");
    }
}

impl ConvertProgress for CliProgress {
    fn on_conversion_start(&self, total_sources: usize) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Converting {total_sources} source(s)…"))
        ));
    }

    fn on_source_start(&self, source_name: &str, total_pages: usize) {
        self.activate();
        self.bar.inc_length(total_pages as u64);
        self.bar.set_message(shorten(source_name, 32));
    }

    fn on_page(&self, source_name: &str, seq: usize, total: usize) {
        self.bar.println(format!(
            "  {} {}  {}",
            green("✓"),
            source_name,
            dim(&format!("page {seq}/{total}")),
        ));
        self.bar.inc(1);
    }

    fn on_source_error(&self, source_name: &str, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {}  {}",
            red("✗"),
            source_name,
            red(&shorten(error, 80)),
        ));
    }

    fn on_conversion_complete(&self, pages_emitted: usize) {
        self.bar.finish_and_clear();
        let errors = self.errors.load(Ordering::SeqCst);
        if errors == 0 {
            eprintln!(
                "{} {} page(s) ready",
                green("✔"),
                bold(&pages_emitted.to_string())
            );
        } else {
            eprintln!(
                "{} {} page(s) ready  ({} source(s) failed)",
                cyan("⚠"),
                bold(&pages_emitted.to_string()),
                red(&errors.to_string()),
            );
        }
    }
}

/// Bar for the extraction phase, driven by polling the item store.
fn extraction_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} items  ⏱ {elapsed_precise}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
    bar.set_style(style);
    bar.set_prefix("Extracting");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract three columns from every page of a PDF
  doc2rows --columns "Description,Qty,Unit Price" invoices.pdf

  # Mix PDFs and photos in one batch
  doc2rows --columns "Name,Amount" scan1.pdf receipt.jpg page.png

  # Only pages 3-15 of each source
  doc2rows --columns "Item,Total" --pages 3-15 catalogue.pdf

  # CSV to a file
  doc2rows --columns "SKU,Price" --format csv -o prices.csv stock.pdf

  # Full JSON report (items, statuses, errors) instead of rows
  doc2rows --columns "Ref,Date" --format json ledger.pdf

  # Persist run state for inspection after the process exits
  doc2rows --columns "Name" --record run.json forms.pdf

  # Page counts and dimensions only, no service calls
  doc2rows --inspect-only *.pdf

ENVIRONMENT VARIABLES:
  DOC2ROWS_ENDPOINT       Extraction service URL (same as --endpoint)
  DOC2ROWS_API_TOKEN      Bearer token sent to the extraction service
  DOC2ROWS_ARCHIVE_URL    Object-store base URL for archiving source files
  PDFIUM_LIB_PATH         Path to an existing libpdfium build
  RUST_LOG                Overrides the log filter (e.g. doc2rows=debug)

SETUP:
  1. Install pdfium:      download a release from bblanchon/pdfium-binaries
                          and point PDFIUM_LIB_PATH at the shared library,
                          or install pdfium system-wide.
  2. Point at a service:  export DOC2ROWS_ENDPOINT=https://extract.example.com/v1/rows
  3. Extract:             doc2rows --columns "Description,Qty" document.pdf

CANCELLATION:
  Ctrl-C stops cleanly: in-flight work finishes, the rest stays pending,
  and a --record file written at exit reflects exactly what completed.
"#;

/// Extract structured rows from scanned documents via a vision service.
#[derive(Parser, Debug)]
#[command(
    name = "doc2rows",
    version,
    about = "Extract structured rows from PDFs and scanned images",
    long_about = "Convert documents (PDF, PNG, JPEG) into per-page rasters and extract \
structured rows from them using a vision extraction service. Pages are rendered via \
pdfium; extraction runs through a bounded worker pool with per-item retry.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Source files: PDFs, PNGs or JPEGs, converted in the order given.
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    /// Comma-separated column headers, e.g. "Description,Qty,Unit Price".
    #[arg(
        short,
        long,
        required_unless_present = "inspect_only",
        long_help = "Column headers for the extraction schema. Keys are derived \
automatically (\"Unit Price\" -> unit_price) and row cells are keyed by them."
    )]
    columns: Option<String>,

    /// Extraction service URL.
    #[arg(short, long, env = "DOC2ROWS_ENDPOINT", required_unless_present = "inspect_only")]
    endpoint: Option<String>,

    /// Write output to this file instead of stdout.
    #[arg(short, long, env = "DOC2ROWS_OUTPUT")]
    output: Option<PathBuf>,

    /// Output format for the extracted rows.
    #[arg(long, env = "DOC2ROWS_FORMAT", value_enum, default_value = "table")]
    format: FormatArg,

    /// Page selection applied to every source: all, 5, or 3-15.
    #[arg(long, env = "DOC2ROWS_PAGES", default_value = "all")]
    pages: String,

    /// Number of concurrent extraction service calls.
    #[arg(long, env = "DOC2ROWS_CONCURRENCY", default_value_t = 5)]
    concurrency: usize,

    /// Attempts per page against the service (1 call + retries).
    #[arg(long, env = "DOC2ROWS_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Initial retry backoff in milliseconds (doubles per retry).
    #[arg(long, env = "DOC2ROWS_BACKOFF_MS", default_value_t = 1000)]
    backoff_ms: u64,

    /// Maximum rendered page dimension in pixels.
    #[arg(long, env = "DOC2ROWS_MAX_PIXELS", default_value_t = 2000,
          value_parser = clap::value_parser!(u32).range(100..=8000))]
    max_pixels: u32,

    /// Per-call service timeout in seconds.
    #[arg(long, env = "DOC2ROWS_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Password for encrypted PDFs.
    #[arg(long, env = "DOC2ROWS_PASSWORD")]
    password: Option<String>,

    /// Archive source files to this object-store base URL before rendering.
    #[arg(long, env = "DOC2ROWS_ARCHIVE_URL")]
    archive_url: Option<String>,

    /// Persist the run record (items, statuses, rows) to this JSON file.
    #[arg(long, env = "DOC2ROWS_RECORD")]
    record: Option<PathBuf>,

    /// Print page counts and dimensions, no conversion or extraction.
    #[arg(long)]
    inspect_only: bool,

    /// Output inspect results as JSON.
    #[arg(long, requires = "inspect_only")]
    json: bool,

    /// Disable progress bars.
    #[arg(long, env = "DOC2ROWS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOC2ROWS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and the extracted rows.
    #[arg(short, long, env = "DOC2ROWS_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum FormatArg {
    /// Aligned text table.
    Table,
    /// Full JSON report: outcome, progress, items and rows.
    Json,
    /// Comma-separated values with a header row.
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Progress bars replace INFO logs; verbose wins over everything.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Load sources ─────────────────────────────────────────────────────
    let mut sources = Vec::with_capacity(cli.sources.len());
    for path in &cli.sources {
        let source = SourceInput::from_path(path)
            .with_context(|| format!("Failed to load source {}", path.display()))?;
        sources.push(source);
    }

    let config = build_config(&cli, show_progress)?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let mut summaries = Vec::with_capacity(sources.len());
        for source in &sources {
            let summary = inspect_source(source, &config)
                .await
                .with_context(|| format!("Failed to inspect '{}'", source.name))?;
            summaries.push(summary);
        }

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&summaries)
                    .context("Failed to serialise summaries")?
            );
        } else {
            for s in &summaries {
                let size = s
                    .first_page_size
                    .map(|(w, h)| format!("{w}x{h}"))
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{:<40} {:?}  {} page(s)  first page {}",
                    s.name, s.kind, s.page_count, size
                );
            }
        }
        return Ok(());
    }

    let columns = parse_columns(cli.columns.as_deref().unwrap_or_default())?;
    let endpoint = cli
        .endpoint
        .clone()
        .context("An extraction endpoint is required (--endpoint or DOC2ROWS_ENDPOINT)")?;

    // ── Ctrl-C: first press cancels cleanly, second aborts ───────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!(
                    "\n{} cancelling, letting in-flight work finish (Ctrl-C again to abort)",
                    cyan("⚠")
                );
                cancel.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    }

    // ── Convert ──────────────────────────────────────────────────────────
    let collected = collect_pages(sources, &config, cancel.clone()).await;
    if collected.canceled {
        eprintln!(
            "{} cancelled during conversion; {} page(s) had been converted",
            cyan("⚠"),
            collected.pages.len()
        );
        return Ok(());
    }
    if collected.pages.is_empty() {
        for e in &collected.errors {
            eprintln!("{} {}", red("✗"), e);
        }
        anyhow::bail!("No pages could be converted");
    }

    // ── Select pages ─────────────────────────────────────────────────────
    let mut page_store = PageStore::new();
    for page in collected.pages {
        page_store.add_page(page);
    }
    let selected_count = match parse_pages(&cli.pages)? {
        PageChoice::All => {
            page_store.select_all_for_extraction();
            page_store.len()
        }
        PageChoice::Range(from, to) => page_store.select_range_for_extraction(from, to),
    };
    if selected_count == 0 {
        anyhow::bail!("Page selection '{}' matched no pages", cli.pages);
    }

    // ── Extract ──────────────────────────────────────────────────────────
    let items = Arc::new(ItemStore::from_pages(&page_store.extraction_pages()));

    let token = std::env::var("DOC2ROWS_API_TOKEN").ok().filter(|t| !t.is_empty());
    let extractor = Arc::new(
        HttpExtractor::with_options(&endpoint, cli.api_timeout, token)
            .context("Failed to build the extraction client")?,
    );
    let record_debounce = Duration::from_millis(config.record_debounce_ms);
    let runner = Arc::new(ExtractionRunner::new(
        Arc::clone(&items),
        extractor,
        config,
    ));

    // ── Record persistence: debounced during the run, flushed at exit ────
    let record_writer = cli.record.as_ref().map(|path| {
        let store: Arc<dyn RecordStore> = Arc::new(JsonFileRecordStore::new(path));
        Arc::new(DebouncedRecordWriter::new(store, record_debounce))
    });
    let persister = record_writer.clone().map(|writer| {
        let items = Arc::clone(&items);
        let columns = columns.clone();
        tokio::spawn(async move {
            loop {
                writer.queue(RunRecord::new(Some(columns.clone()), items.snapshot()));
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
    });

    let cancel_watch = {
        let runner = Arc::clone(&runner);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            runner.cancel();
        })
    };

    if cancel.is_cancelled() {
        return Ok(());
    }

    let bar = show_progress.then(|| extraction_bar(items.len() as u64));
    let poller = bar.clone().map(|bar| {
        let items = Arc::clone(&items);
        tokio::spawn(async move {
            loop {
                let p = items.progress();
                bar.set_position((p.completed + p.error) as u64);
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
        })
    });

    let outcome = runner.run(&columns).await;

    if let Some(poller) = poller {
        poller.abort();
    }
    if let Some(persister) = persister {
        persister.abort();
    }
    cancel_watch.abort();
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    // ── Flush the final record state (a failed run is still resumable) ───
    if let Some(writer) = &record_writer {
        writer.queue(RunRecord::new(Some(columns.clone()), items.snapshot()));
        writer.flush().await.with_context(|| {
            format!(
                "Failed to write record {}",
                cli.record.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
            )
        })?;
        if !cli.quiet {
            if let Some(ref path) = cli.record {
                eprintln!("{} record written to {}", dim("·"), path.display());
            }
        }
    }

    let outcome = outcome.context("Extraction run failed")?;

    print_summary(&cli, &outcome, &items.progress());

    // ── Output rows ──────────────────────────────────────────────────────
    let rendered = match cli.format {
        FormatArg::Table => render_table(&columns, &items.completed_rows()),
        FormatArg::Csv => render_csv(&columns, &items.completed_rows()),
        FormatArg::Json => {
            #[derive(serde::Serialize)]
            struct Report {
                columns: ColumnSpec,
                outcome: RunOutcome,
                progress: Progress,
                items: Vec<ExtractionItem>,
                rows: Vec<Row>,
            }
            let report = Report {
                columns: columns.clone(),
                outcome,
                progress: items.progress(),
                items: items.snapshot(),
                rows: items.completed_rows(),
            };
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        }
    };

    match cli.output {
        Some(ref path) => {
            tokio::fs::write(path, rendered.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!("{} rows written to {}", green("✔"), bold(&path.display().to_string()));
            }
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(rendered.as_bytes())
                .context("Failed to write to stdout")?;
            if !rendered.ends_with('\n') {
                handle.write_all(b"\n").ok();
            }
        }
    }

    Ok(())
}

/// Map CLI args to a [`PipelineConfig`].
fn build_config(cli: &Cli, show_progress: bool) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .max_render_pixels(cli.max_pixels)
        .concurrency(cli.concurrency)
        .max_attempts(cli.max_attempts)
        .retry_backoff_ms(cli.backoff_ms);

    if let Some(ref password) = cli.password {
        builder = builder.password(password.clone());
    }
    if let Some(ref base) = cli.archive_url {
        let store = HttpObjectStore::new(base.clone())
            .context("Failed to build the archive client")?;
        builder = builder.object_store(Arc::new(store));
    }
    if show_progress && !cli.inspect_only {
        builder = builder.progress(CliProgress::new());
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--columns` into a validated [`ColumnSpec`].
fn parse_columns(raw: &str) -> Result<ColumnSpec> {
    let names: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .collect();
    ColumnSpec::from_display_names(&names).context("Invalid --columns value")
}

enum PageChoice {
    All,
    Range(usize, usize),
}

/// Parse `--pages` into a selection: all, a single page, or a range.
fn parse_pages(s: &str) -> Result<PageChoice> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(PageChoice::All);
    }

    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start.trim().parse().context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;
        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!("Invalid page range '{}-{}': start must be <= end", start, end);
        }
        return Ok(PageChoice::Range(start, end));
    }

    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }
    Ok(PageChoice::Range(page, page))
}

/// One line per run: ticks, counts, duration.
fn print_summary(cli: &Cli, outcome: &RunOutcome, progress: &Progress) {
    if cli.quiet {
        return;
    }
    let tick = if outcome.canceled {
        cyan("⚠")
    } else if outcome.failed == 0 {
        green("✔")
    } else {
        cyan("⚠")
    };
    eprintln!(
        "{}  {}/{} items extracted  {}ms  ({}%)",
        tick,
        outcome.completed,
        outcome.dispatched,
        outcome.duration_ms,
        progress.percent,
    );
    if outcome.failed > 0 {
        eprintln!("   {} item(s) failed; see --format json for details", red(&outcome.failed.to_string()));
    }
    if outcome.canceled {
        eprintln!(
            "   cancelled: {} item(s) still pending; run again to resume",
            outcome.skipped
        );
    }
}

// ── Row rendering ────────────────────────────────────────────────────────────

/// Aligned text table, headers first, cells truncated to keep lines sane.
fn render_table(columns: &ColumnSpec, rows: &[Row]) -> String {
    const MAX_CELL: usize = 40;

    let headers: Vec<String> = columns
        .columns()
        .iter()
        .map(|c| c.display_name.clone())
        .collect();
    let keys: Vec<&str> = columns.keys().collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            keys.iter()
                .enumerate()
                .map(|(i, key)| {
                    let cell = shorten(row.get(*key).map(String::as_str).unwrap_or(""), MAX_CELL);
                    widths[i] = widths[i].max(cell.chars().count());
                    cell
                })
                .collect()
        })
        .collect();

    let mut out = String::new();
    let format_line = |fields: &[String], widths: &[usize]| {
        let mut line = String::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                line.push_str("  ");
            }
            line.push_str(field);
            let pad = widths[i].saturating_sub(field.chars().count());
            line.extend(std::iter::repeat(' ').take(pad));
        }
        line.trim_end().to_string()
    };

    out.push_str(&format_line(&headers, &widths));
    out.push('\n');
    let rule: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
    out.push_str(&format_line(&rule, &widths));
    out.push('\n');
    for row in &cells {
        out.push_str(&format_line(row, &widths));
        out.push('\n');
    }
    out
}

/// CSV with a header row of display names; quotes only where needed.
fn render_csv(columns: &ColumnSpec, rows: &[Row]) -> String {
    fn escape(field: &str) -> String {
        if field.contains([',', '"', '\n', '\r']) {
            format!("\"{}\"", field.replace('"', "\"\""))
        } else {
            field.to_string()
        }
    }

    let keys: Vec<&str> = columns.keys().collect();
    let mut out = String::new();

    let header: Vec<String> = columns
        .columns()
        .iter()
        .map(|c| escape(&c.display_name))
        .collect();
    out.push_str(&header.join(","));
    out.push('\n');

    for row in rows {
        let record: Vec<String> = keys
            .iter()
            .map(|key| escape(row.get(*key).map(String::as_str).unwrap_or("")))
            .collect();
        out.push_str(&record.join(","));
        out.push('\n');
    }
    out
}
