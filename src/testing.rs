//! Test doubles for the collaborator seams.
//!
//! Public so downstream crates can drive the pipeline in their own tests
//! without a live extraction service. [`MockExtractor`] scripts outcomes
//! per raster and records call counts plus the in-flight high-water mark,
//! which is how the concurrency ceiling is asserted.
//!
//! Mock behaviour is keyed by the raster's PNG bytes: build items with
//! [`marker_raster`] and script outcomes for the same tag.

use crate::error::{ServiceError, StorageError};
use crate::service::{ExtractOutput, Extractor};
use crate::storage::ObjectStore;
use crate::types::{ColumnSpec, RasterPayload, Row};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A tiny fake raster whose bytes are the tag, for keying mock behaviour.
pub fn marker_raster(tag: &str) -> RasterPayload {
    RasterPayload {
        png: tag.as_bytes().to_vec(),
        width: 1,
        height: 1,
    }
}

/// Scripted [`Extractor`] for tests.
pub struct MockExtractor {
    default_rows: Vec<Row>,
    confidence: Option<f32>,
    delay: Option<Duration>,
    rows_for: Mutex<HashMap<Vec<u8>, Vec<Row>>>,
    fail_counts: Mutex<HashMap<Vec<u8>, u32>>,
    always_fail: Mutex<HashSet<Vec<u8>>>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockExtractor {
    /// Succeed every call with `default_rows`.
    pub fn new(default_rows: Vec<Row>) -> Self {
        Self {
            default_rows,
            confidence: None,
            delay: None,
            rows_for: Mutex::new(HashMap::new()),
            fail_counts: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashSet::new()),
            calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Sleep this long inside every call, so calls overlap under a paused
    /// or real clock.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer calls for `tag` with these rows instead of the default.
    pub fn with_rows_for(self, tag: &str, rows: Vec<Row>) -> Self {
        self.rows_for
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag.as_bytes().to_vec(), rows);
        self
    }

    /// Fail the first `times` calls for `tag`, then succeed.
    pub fn failing_times(self, tag: &str, times: u32) -> Self {
        self.fail_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag.as_bytes().to_vec(), times);
        self
    }

    /// Fail every call for `tag`.
    pub fn always_failing(self, tag: &str) -> Self {
        self.always_fail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag.as_bytes().to_vec());
        self
    }

    /// Total calls made. The handle survives moving the mock into a runner.
    pub fn call_count_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Highest number of calls that were ever in flight at once.
    pub fn max_in_flight_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_in_flight)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(
        &self,
        raster: &RasterPayload,
        _columns: &ColumnSpec,
    ) -> Result<ExtractOutput, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let key = raster.png.as_slice();

        if self
            .always_fail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
        {
            return Err(ServiceError::Http {
                status: 503,
                detail: "scripted failure".into(),
            });
        }

        {
            let mut fail_counts = self.fail_counts.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(remaining) = fail_counts.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ServiceError::Http {
                        status: 503,
                        detail: "scripted failure".into(),
                    });
                }
            }
        }

        let rows = self
            .rows_for
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.default_rows.clone());

        Ok(ExtractOutput {
            rows,
            confidence: self.confidence,
        })
    }
}

/// In-memory [`ObjectStore`] answering `memory://` URLs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), bytes);
        Ok(format!("memory://{key}"))
    }
}
