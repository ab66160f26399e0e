//! Storage collaborators: object uploads and run-record persistence.
//!
//! Both collaborators sit behind traits so the pipeline never depends on a
//! concrete backend:
//!
//! * [`ObjectStore`] receives uploaded source files and answers with a URL.
//!   Uploads are best-effort; a failed upload is logged and conversion
//!   carries on without a [`crate::types::StorageRef`].
//! * [`RecordStore`] persists the run state ([`RunRecord`]) so a batch can
//!   be resumed after a restart. Writes happen in bursts while a run is
//!   active, so the [`DebouncedRecordWriter`] coalesces them and offers an
//!   immediate [`flush`](DebouncedRecordWriter::flush) for teardown.

use crate::error::StorageError;
use crate::types::{ColumnSpec, ExtractionItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ── Object store ─────────────────────────────────────────────────────────

/// Destination for uploaded source files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return a URL for the stored object.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

/// Upload without letting a storage failure escape. Returns the URL on
/// success, `None` (after a warning) on failure.
pub async fn upload_best_effort(
    store: &dyn ObjectStore,
    key: &str,
    bytes: Vec<u8>,
    content_type: &str,
) -> Option<String> {
    match store.put(key, bytes, content_type).await {
        Ok(url) => {
            debug!("Uploaded '{}' -> {}", key, url);
            Some(url)
        }
        Err(e) => {
            warn!("Object upload failed for '{}': {}", key, e);
            None
        }
    }
}

/// `ObjectStore` over plain HTTP PUT, for pre-signed or path-addressed
/// endpoints.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::Upload(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let url = format!("{}/{}", self.base_url, key);
        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| StorageError::Upload(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Upload(format!("HTTP {status} for {url}")));
        }
        Ok(url)
    }
}

// ── Run records ──────────────────────────────────────────────────────────

/// The durable snapshot of a batch: column spec plus every item's state.
///
/// Rasters are not part of the record (see
/// [`crate::types::ExtractionItem`]); a restored batch re-sends nothing and
/// its unfinished items without payloads fail fast on the next run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub columns: Option<ColumnSpec>,
    pub items: Vec<ExtractionItem>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(columns: Option<ColumnSpec>, items: Vec<ExtractionItem>) -> Self {
        Self {
            columns,
            items,
            updated_at: Utc::now(),
        }
    }
}

/// Persistence for [`RunRecord`]s.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save(&self, record: &RunRecord) -> Result<(), StorageError>;
    async fn load(&self) -> Result<Option<RunRecord>, StorageError>;
}

/// In-memory record store for tests and short-lived sessions.
#[derive(Default)]
pub struct MemoryRecordStore {
    slot: Mutex<Option<RunRecord>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `save` has been called. Used by debounce tests.
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, record: &RunRecord) -> Result<(), StorageError> {
        self.saves
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<RunRecord>, StorageError> {
        Ok(self
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// Record store backed by a single JSON file.
///
/// Saves are atomic (write to a sibling temp file, then rename) so a crash
/// mid-write never leaves a truncated record behind.
pub struct JsonFileRecordStore {
    path: PathBuf,
}

impl JsonFileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn save(&self, record: &RunRecord) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(record)?;
        let write_failed = |source| StorageError::WriteFailed {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(write_failed)?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(write_failed)?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<RunRecord>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::ReadFailed {
                    path: self.path.display().to_string(),
                    source: e,
                })
            }
        };
        let record = serde_json::from_slice(&bytes)?;
        Ok(Some(record))
    }
}

// ── Debounced writer ─────────────────────────────────────────────────────

/// Trailing-edge debounce over a [`RecordStore`].
///
/// [`queue`](Self::queue) replaces the pending record and (re)starts the
/// quiet timer; the newest record is written once no new one has arrived
/// for the configured delay. [`flush`](Self::flush) bypasses the timer and
/// writes the pending record immediately; call it on teardown so the last
/// state of a session is never lost to the debounce window.
pub struct DebouncedRecordWriter {
    store: Arc<dyn RecordStore>,
    pending: Arc<Mutex<Option<RunRecord>>>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
}

impl DebouncedRecordWriter {
    pub fn new(store: Arc<dyn RecordStore>, debounce: Duration) -> Self {
        let pending: Arc<Mutex<Option<RunRecord>>> = Arc::new(Mutex::new(None));
        let notify = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let worker_store = Arc::clone(&store);
        let worker_pending = Arc::clone(&pending);
        let worker_notify = Arc::clone(&notify);
        let worker_shutdown = shutdown.clone();
        tokio::spawn(async move {
            debounce_worker(worker_store, worker_pending, worker_notify, worker_shutdown, debounce)
                .await;
        });

        Self {
            store,
            pending,
            notify,
            shutdown,
        }
    }

    /// Replace the pending record and restart the quiet timer.
    pub fn queue(&self, record: RunRecord) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(record);
        self.notify.notify_one();
    }

    /// Write the pending record now, if any.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let record = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match record {
            Some(r) => self.store.save(&r).await,
            None => Ok(()),
        }
    }
}

impl Drop for DebouncedRecordWriter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Background task: wait for a queued record, let the timer go quiet, save.
async fn debounce_worker(
    store: Arc<dyn RecordStore>,
    pending: Arc<Mutex<Option<RunRecord>>>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    debounce: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = notify.notified() => {}
        }

        // Restart the quiet timer every time a newer record is queued.
        let mut stop = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    stop = true;
                    break;
                }
                _ = notify.notified() => {}
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        let record = pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(r) = record {
            if let Err(e) = store.save(&r).await {
                warn!("Debounced record save failed: {}", e);
            }
        }
        if stop {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> RunRecord {
        RunRecord::new(None, Vec::with_capacity(n))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_queues_saves_once() {
        let store = Arc::new(MemoryRecordStore::new());
        let writer = DebouncedRecordWriter::new(store.clone(), Duration::from_millis(500));

        writer.queue(record(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.queue(record(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.queue(record(3));

        // Quiet period elapses once, after the last queue.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.save_count(), 1);

        // Nothing pending afterwards.
        writer.flush().await.unwrap();
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_immediately() {
        let store = Arc::new(MemoryRecordStore::new());
        let writer = DebouncedRecordWriter::new(store.clone(), Duration::from_secs(60));

        writer.queue(record(1));
        writer.flush().await.unwrap();
        assert_eq!(store.save_count(), 1);

        // The worker finds nothing left to write when its timer fires.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_save_separately() {
        let store = Arc::new(MemoryRecordStore::new());
        let writer = DebouncedRecordWriter::new(store.clone(), Duration::from_millis(200));

        writer.queue(record(1));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.save_count(), 1);

        writer.queue(record(2));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test]
    async fn json_file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let store = JsonFileRecordStore::new(&path);

        assert!(store.load().await.unwrap().is_none());

        store.save(&record(2)).await.unwrap();
        let loaded = store.load().await.unwrap().expect("record present");
        assert!(loaded.columns.is_none());

        // No temp file left behind
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn upload_best_effort_swallows_failure() {
        struct FailingStore;

        #[async_trait]
        impl ObjectStore for FailingStore {
            async fn put(
                &self,
                _key: &str,
                _bytes: Vec<u8>,
                _content_type: &str,
            ) -> Result<String, StorageError> {
                Err(StorageError::Upload("disk full".into()))
            }
        }

        let url = upload_best_effort(&FailingStore, "k", vec![1], "image/png").await;
        assert!(url.is_none());
    }
}
