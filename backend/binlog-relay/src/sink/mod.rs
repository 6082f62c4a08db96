//! Batched delivery to the downstream sink.
//!
//! Events are serialized as they arrive and parked in a FIFO queue. Each flush pops at
//! most one batch and hands it to a delivery task; the flush itself never waits for the
//! sink. Deliveries run concurrently up to the worker limit. A batch that fails is logged
//! and dropped, never re-queued.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::RelayResult;
use crate::event::{ChangeEvent, EventKind};
use crate::metrics::RelayMetrics;

mod kafka;

pub use kafka::KafkaSinkClient;

/// Largest batch a single flush submits.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Downstream batch delivery endpoint.
#[async_trait]
pub trait SinkClient: Send + Sync {
    /// Deliver `records` as one batch, returning how many the sink accepted.
    async fn submit_batch(&self, records: Vec<Vec<u8>>) -> RelayResult<usize>;
}

/// A serialized event waiting for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub payload: Vec<u8>,
    pub kind: EventKind,
    pub log_file: Option<String>,
    pub log_pos: Option<u64>,
}

impl SinkRecord {
    pub fn from_event(event: &ChangeEvent) -> RelayResult<Self> {
        Ok(Self {
            payload: serde_json::to_vec(event)?,
            kind: event.kind,
            log_file: event.log_file.clone(),
            log_pos: event.log_pos,
        })
    }
}

/// Result of a single [`SinkBatcher::flush`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending; no batch was sent
    Empty,
    /// A batch of this many records was handed to a delivery task
    Submitted(usize),
}

pub struct SinkBatcher {
    client: Arc<dyn SinkClient>,
    queue: Mutex<VecDeque<SinkRecord>>,
    workers: Arc<Semaphore>,
    deliveries: Mutex<Vec<JoinHandle<()>>>,
    max_batch_size: usize,
    metrics: Option<RelayMetrics>,
}

impl SinkBatcher {
    /// Create a batcher delivering through `client` with at most `max_workers` batches in flight.
    pub fn new(client: Arc<dyn SinkClient>, max_workers: usize, max_batch_size: usize) -> Self {
        Self {
            client,
            queue: Mutex::new(VecDeque::new()),
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            deliveries: Mutex::new(Vec::new()),
            max_batch_size: max_batch_size.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Serialize `event` and append it to the queue.
    pub fn enqueue(&self, event: &ChangeEvent) -> RelayResult<()> {
        let record = SinkRecord::from_event(event)?;
        let pending = {
            let mut queue = self.lock_queue();
            queue.push_back(record);
            queue.len()
        };

        if let Some(metrics) = &self.metrics {
            metrics.sink_pending.set(pending as i64);
        }
        Ok(())
    }

    /// Pop up to one batch and submit it in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn flush(&self) -> FlushOutcome {
        let (batch, remaining) = {
            let mut queue = self.lock_queue();
            let count = queue.len().min(self.max_batch_size);
            let batch: Vec<SinkRecord> = queue.drain(..count).collect();
            (batch, queue.len())
        };

        if let Some(metrics) = &self.metrics {
            metrics.sink_pending.set(remaining as i64);
        }

        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let count = batch.len();
        debug!(batch_size = count, remaining, "Submitting sink batch");

        let handle = tokio::spawn(deliver(
            self.client.clone(),
            self.workers.clone(),
            batch,
            self.metrics.clone(),
        ));

        let mut deliveries = self.lock_deliveries();
        deliveries.retain(|h| !h.is_finished());
        deliveries.push(handle);

        FlushOutcome::Submitted(count)
    }

    /// Wait until every batch submitted so far has finished its delivery attempt.
    pub async fn wait_for_deliveries(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock_deliveries());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Sink delivery task panicked");
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<SinkRecord>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_deliveries(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn deliver(
    client: Arc<dyn SinkClient>,
    workers: Arc<Semaphore>,
    batch: Vec<SinkRecord>,
    metrics: Option<RelayMetrics>,
) {
    // The semaphore is never closed.
    let Ok(_permit) = workers.acquire_owned().await else {
        return;
    };

    let submitted = batch.len();
    let last_pos = batch.last().and_then(|r| r.log_pos);
    let records = batch.into_iter().map(|r| r.payload).collect();

    match client.submit_batch(records).await {
        Ok(accepted) => {
            info!(delivered = accepted, submitted, last_log_pos = ?last_pos, "Events flushed");
            if let Some(metrics) = &metrics {
                metrics.records_delivered.inc_by(accepted as u64);
                metrics
                    .delivery_failures
                    .inc_by(submitted.saturating_sub(accepted) as u64);
            }
        }
        Err(e) => {
            error!(submitted, last_log_pos = ?last_pos, error = %e, "Sink batch delivery failed, batch dropped");
            if let Some(metrics) = &metrics {
                metrics.delivery_failures.inc_by(submitted as u64);
            }
        }
    }
}
