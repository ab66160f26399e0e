//! Configuration for the conversion and extraction pipeline.
//!
//! All behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share a config across the converter and the runner, log it
//! once at startup, and diff two runs to understand why their outcomes
//! differ.

use crate::error::Doc2RowsError;
use crate::progress::ProgressCallback;
use crate::storage::ObjectStore;
use std::fmt;
use std::sync::Arc;

/// Configuration for a document-to-rows pipeline.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use doc2rows::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .max_render_pixels(1600)
///     .concurrency(5)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Maximum rendered dimension (width or height) in pixels. Default: 2000.
    ///
    /// Caps either dimension, scaling the other proportionally, so a poster
    /// sized page never allocates more than roughly `max_render_pixels²`
    /// bytes of pixels. 2000 px keeps small print legible to the extraction
    /// service while staying under typical request-size limits.
    pub max_render_pixels: u32,

    /// Longest edge of the thumbnail raster in pixels. Default: 256.
    ///
    /// Thumbnails only need to be recognisable in a list view; 256 px keeps
    /// the per-page memory cost of a 200-page batch negligible.
    pub thumbnail_pixels: u32,

    /// Number of concurrent extraction service calls. Default: 5.
    ///
    /// The service is network-bound; five in-flight calls saturate most
    /// deployments without tripping rate limits. Lower it if the service
    /// answers with 429s, raise it for self-hosted backends.
    pub concurrency: usize,

    /// Total attempts per item against the extraction service. Default: 3.
    ///
    /// One initial call plus two retries. Transient failures (overloaded
    /// backend, network blip) almost always clear within two retries; more
    /// attempts mostly delay the error status the user will act on anyway.
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 1000.
    ///
    /// Doubles after each failed attempt: 1 s then 2 s. Backoff keeps N
    /// concurrent workers from re-hammering a recovering service in lockstep.
    pub retry_backoff_ms: u64,

    /// Password for encrypted paged documents. Applied to every source.
    pub password: Option<String>,

    /// Delay for coalescing record-store writes in milliseconds. Default: 500.
    ///
    /// Item state changes in bursts while a run is active; the debounced
    /// writer folds a burst into a single write once the state has been
    /// quiet for this long.
    pub record_debounce_ms: u64,

    /// Advisory per-page progress callback for conversion. Default: none.
    pub progress: Option<ProgressCallback>,

    /// Object store for archiving source files. Default: none.
    ///
    /// When set, the converter uploads each source's original bytes before
    /// rendering it and stamps the returned URL on the emitted pages. Upload
    /// failures are logged and ignored; conversion never depends on the
    /// archive succeeding.
    pub object_store: Option<Arc<dyn ObjectStore>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_render_pixels: 2000,
            thumbnail_pixels: 256,
            concurrency: 5,
            max_attempts: 3,
            retry_backoff_ms: 1000,
            password: None,
            record_debounce_ms: 500,
            progress: None,
            object_store: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("max_render_pixels", &self.max_render_pixels)
            .field("thumbnail_pixels", &self.thumbnail_pixels)
            .field("concurrency", &self.concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("record_debounce_ms", &self.record_debounce_ms)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .field("object_store", &self.object_store.as_ref().map(|_| "<store>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_render_pixels(mut self, px: u32) -> Self {
        self.config.max_render_pixels = px.max(100);
        self
    }

    pub fn thumbnail_pixels(mut self, px: u32) -> Self {
        self.config.thumbnail_pixels = px.clamp(32, 1024);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn record_debounce_ms(mut self, ms: u64) -> Self {
        self.config.record_debounce_ms = ms;
        self
    }

    pub fn progress(mut self, callback: ProgressCallback) -> Self {
        self.config.progress = Some(callback);
        self
    }

    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.config.object_store = Some(store);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Doc2RowsError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(Doc2RowsError::InvalidConfig(
                "concurrency must be >= 1".into(),
            ));
        }
        if c.max_attempts == 0 {
            return Err(Doc2RowsError::InvalidConfig(
                "max_attempts must be >= 1".into(),
            ));
        }
        if c.thumbnail_pixels > c.max_render_pixels {
            return Err(Doc2RowsError::InvalidConfig(format!(
                "thumbnail_pixels ({}) must not exceed max_render_pixels ({})",
                c.thumbnail_pixels, c.max_render_pixels
            )));
        }
        Ok(self.config)
    }
}
