//! Checkpoint persistence.
//!
//! The store keeps a single slot at a fixed key of a [`CheckpointBackend`]. Markers
//! produced by the consumer loop are buffered in memory; every flush collapses the
//! buffer to its newest marker and writes it once, since a later marker always
//! supersedes an earlier one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RelayResult;

mod s3;

pub use s3::S3CheckpointBackend;

/// A `(log file, log position)` pair to resume replication from.
///
/// Both halves are optional: a fresh deployment has no checkpoint yet, and some
/// log-state events know the file but not the offset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointMarker {
    pub log_file: Option<String>,
    pub log_pos: Option<u64>,
}

impl CheckpointMarker {
    pub fn new(log_file: Option<String>, log_pos: Option<u64>) -> Self {
        Self { log_file, log_pos }
    }

    pub fn at(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self::new(Some(log_file.into()), Some(log_pos))
    }

    /// True when both the file and the position are known.
    pub fn is_complete(&self) -> bool {
        self.log_file.is_some() && self.log_pos.is_some()
    }
}

impl fmt::Display for CheckpointMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.log_file, self.log_pos) {
            (Some(file), Some(pos)) => write!(f, "{}:{}", file, pos),
            (Some(file), None) => write!(f, "{}:?", file),
            (None, _) => write!(f, "<none>"),
        }
    }
}

/// Key-addressed durable blob storage for checkpoints.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Fetch the blob stored under `key`.
    ///
    /// Returns `Ok(None)` when nothing has been stored yet; any other failure is an error.
    async fn get(&self, key: &str) -> RelayResult<Option<Vec<u8>>>;

    /// Store `body` under `key`, replacing any previous value.
    async fn put(&self, key: &str, body: Vec<u8>) -> RelayResult<()>;
}

/// Buffered single-slot checkpoint store.
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
    key: String,
    pending: Mutex<VecDeque<CheckpointMarker>>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the last persisted marker, or an empty marker on first run.
    pub async fn read(&self) -> RelayResult<CheckpointMarker> {
        match self.backend.get(&self.key).await? {
            Some(body) => {
                let marker: CheckpointMarker = serde_json::from_slice(&body)?;
                debug!(key = %self.key, checkpoint = %marker, "Loaded checkpoint");
                Ok(marker)
            }
            None => {
                info!(key = %self.key, "No checkpoint saved");
                Ok(CheckpointMarker::default())
            }
        }
    }

    /// Persist `marker` immediately, replacing whatever was stored.
    pub async fn write(&self, marker: &CheckpointMarker) -> RelayResult<()> {
        let body = serde_json::to_vec(marker)?;
        self.backend.put(&self.key, body).await?;
        debug!(key = %self.key, checkpoint = %marker, "Checkpoint written");
        Ok(())
    }

    /// Buffer a marker for the next flush.
    pub fn enqueue(&self, marker: CheckpointMarker) {
        self.lock_pending().push_back(marker);
    }

    /// Write the newest buffered marker and drop the rest.
    ///
    /// Returns `Ok(false)` without touching the backend when nothing is buffered. The
    /// buffer is cleared before the write, so a failed write loses those markers; the
    /// next event refills it.
    pub async fn flush(&self) -> RelayResult<bool> {
        let latest = {
            let mut pending = self.lock_pending();
            let latest = pending.pop_back();
            pending.clear();
            latest
        };

        match latest {
            Some(marker) => {
                self.write(&marker).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Seed the store with `marker`, bypassing the periodic flush.
    pub async fn init(&self, marker: CheckpointMarker) -> RelayResult<bool> {
        self.enqueue(marker);
        self.flush().await
    }

    /// Newest marker waiting to be flushed.
    pub fn latest_pending(&self) -> Option<CheckpointMarker> {
        self.lock_pending().back().cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<CheckpointMarker>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RelayError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory backend counting writes.
    #[derive(Default)]
    pub(crate) struct MemoryBackend {
        pub objects: Mutex<HashMap<String, Vec<u8>>>,
        pub puts: AtomicUsize,
        pub fail_reads: AtomicBool,
        pub fail_writes: AtomicBool,
    }

    #[async_trait]
    impl CheckpointBackend for MemoryBackend {
        async fn get(&self, key: &str) -> RelayResult<Option<Vec<u8>>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(RelayError::CheckpointStorage("access denied".to_string()));
            }
            Ok(self.objects.lock().unwrap().get(key).cloned())
        }

        async fn put(&self, key: &str, body: Vec<u8>) -> RelayResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(RelayError::CheckpointStorage("bucket unavailable".to_string()));
            }
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }
    }

    fn store() -> (Arc<MemoryBackend>, CheckpointStore) {
        let backend = Arc::new(MemoryBackend::default());
        let store = CheckpointStore::new(backend.clone(), "relay/checkpoint.json");
        (backend, store)
    }

    #[tokio::test]
    async fn test_read_without_checkpoint_is_empty() {
        let (_, store) = store();
        let marker = store.read().await.unwrap();
        assert_eq!(marker, CheckpointMarker::new(None, None));
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let (backend, store) = store();
        backend.fail_reads.store(true, Ordering::SeqCst);
        tokio_test::assert_err!(store.read().await);
    }

    #[tokio::test]
    async fn test_flush_persists_only_newest_marker() {
        let (backend, store) = store();
        store.enqueue(CheckpointMarker::at("F", 1));
        store.enqueue(CheckpointMarker::at("F", 2));
        store.enqueue(CheckpointMarker::at("F", 3));

        assert!(store.flush().await.unwrap());
        assert_eq!(backend.puts.load(Ordering::SeqCst), 1);
        assert_eq!(store.read().await.unwrap(), CheckpointMarker::at("F", 3));
        assert_eq!(store.pending_len(), 0);

        assert!(!store.flush().await.unwrap());
        assert_eq!(backend.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_failure_propagates_and_drops_pending() {
        let (backend, store) = store();
        backend.fail_writes.store(true, Ordering::SeqCst);
        store.enqueue(CheckpointMarker::at("F", 9));

        tokio_test::assert_err!(store.flush().await);
        assert!(store.latest_pending().is_none());
    }

    #[tokio::test]
    async fn test_init_writes_immediately() {
        let (backend, store) = store();
        assert!(store.init(CheckpointMarker::at("mysql-bin.000042", 154)).await.unwrap());
        assert_eq!(backend.puts.load(Ordering::SeqCst), 1);

        let raw = backend.objects.lock().unwrap()["relay/checkpoint.json"].clone();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"log_file": "mysql-bin.000042", "log_pos": 154})
        );
    }

    #[test]
    fn test_marker_display() {
        assert_eq!(CheckpointMarker::at("b.01", 4).to_string(), "b.01:4");
        assert_eq!(CheckpointMarker::new(Some("b.01".into()), None).to_string(), "b.01:?");
        assert_eq!(CheckpointMarker::default().to_string(), "<none>");
        assert!(!CheckpointMarker::default().is_complete());
    }
}
