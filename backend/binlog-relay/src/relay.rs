//! The consume loop tying the pipeline together.
//!
//! A [`Relay`] resolves where to resume, opens the change stream there and feeds every
//! record through the normalizer into the two pending queues. Two [`PeriodicTask`]s drain
//! those queues on their own timelines: one ships sink batches, the other persists the
//! newest checkpoint. The drains are not coordinated with each other.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointMarker, CheckpointStore};
use crate::error::{RelayError, RelayResult};
use crate::event::{ChangeEvent, EventNormalizer, RawRecord};
use crate::metrics::RelayMetrics;
use crate::position::{reconcile, PositionSource};
use crate::scheduler::PeriodicTask;
use crate::sink::SinkBatcher;
use crate::source::{ChangeSource, ChangeStream};

pub const SINK_FLUSH_SCHEDULE: &str = "sink-flush";
pub const CHECKPOINT_FLUSH_SCHEDULE: &str = "checkpoint-flush";

/// Lifecycle of a relay run, published on the `binlog_relay_state` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Initializing = 0,
    Running = 1,
    Draining = 2,
    Closed = 3,
}

impl RelayState {
    pub fn as_gauge(self) -> i64 {
        self as i64
    }
}

/// Why the consume loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The source reported no more records
    Exhausted,
    /// The shutdown future resolved
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Records consumed from the stream
    pub events: u64,
    pub end: StreamEnd,
    pub resumed_from: CheckpointMarker,
}

pub struct Relay {
    source: Arc<dyn ChangeSource>,
    positions: Arc<dyn PositionSource>,
    checkpoints: Arc<CheckpointStore>,
    sink: Arc<SinkBatcher>,
    normalizer: EventNormalizer,
    sink_flush_interval: Duration,
    checkpoint_flush_interval: Duration,
    metrics: Option<RelayMetrics>,
    state: RelayState,
}

impl Relay {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        positions: Arc<dyn PositionSource>,
        checkpoints: Arc<CheckpointStore>,
        sink: Arc<SinkBatcher>,
    ) -> Self {
        Self {
            source,
            positions,
            checkpoints,
            sink,
            normalizer: EventNormalizer::default(),
            sink_flush_interval: Duration::from_secs(1),
            checkpoint_flush_interval: Duration::from_secs(5),
            metrics: None,
            state: RelayState::Initializing,
        }
    }

    pub fn with_normalizer(mut self, normalizer: EventNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_flush_intervals(mut self, sink: Duration, checkpoint: Duration) -> Self {
        self.sink_flush_interval = sink;
        self.checkpoint_flush_interval = checkpoint;
        self
    }

    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        metrics.relay_state.set(self.state.as_gauge());
        self.metrics = Some(metrics);
        self
    }

    /// Saved checkpoint reconciled against the server's current position.
    ///
    /// Fails when the checkpoint cannot be read; starting blind could replay or skip
    /// an unbounded amount of history.
    pub async fn resolve_resume_position(&self) -> RelayResult<CheckpointMarker> {
        let saved = self.checkpoints.read().await?;
        let current = self.positions.current_position().await?;
        let resume = reconcile(&current, &saved);

        info!(saved = %saved, current = %current, resume = %resume, "Resolved resume position");
        Ok(resume)
    }

    /// Normalize one record and queue its checkpoint and, if deliverable, the event.
    pub fn handle_event(&self, raw: RawRecord) -> RelayResult<ChangeEvent> {
        let event = self.normalizer.normalize(raw);
        self.checkpoints.enqueue(event.checkpoint());

        if event.kind.is_deliverable() {
            self.sink.enqueue(&event)?;
            if let Some(metrics) = &self.metrics {
                metrics.events_enqueued.inc();
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.events_consumed.inc();
        }
        Ok(event)
    }

    /// Run until the stream ends, fails, or `shutdown` resolves.
    ///
    /// Queued data not yet flushed when the loop stops is abandoned.
    pub async fn run<S>(mut self, shutdown: S) -> RelayResult<RunSummary>
    where
        S: Future<Output = ()>,
    {
        let resume = self.resolve_resume_position().await?;
        let mut stream = self.source.open(&resume).await?;

        let schedules = [self.start_sink_schedule(), self.start_checkpoint_schedule()];
        self.transition(RelayState::Running);

        let mut events: u64 = 0;
        let outcome = {
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown => {
                        info!("Shutdown requested, stopping consumption");
                        break Ok(StreamEnd::Shutdown);
                    }
                    next = stream.next() => match next {
                        Ok(Some(raw)) => {
                            if let Err(e) = self.handle_event(raw) {
                                break Err(e);
                            }
                            events += 1;
                        }
                        Ok(None) => {
                            info!(events, "Change stream exhausted");
                            break Ok(StreamEnd::Exhausted);
                        }
                        Err(e) => {
                            error!(events, error = %e, "Change stream failed");
                            break Err(e);
                        }
                    }
                }
            }
        };

        self.drain(schedules, stream.as_mut()).await;

        outcome.map(|end| RunSummary {
            events,
            end,
            resumed_from: resume,
        })
    }

    async fn drain(&mut self, schedules: [PeriodicTask; 2], stream: &mut dyn ChangeStream) {
        self.transition(RelayState::Draining);

        for schedule in schedules {
            schedule.stop().await;
        }

        if let Err(e) = stream.close().await {
            warn!(error = %e, "Failed to close change stream");
        }

        info!(
            abandoned_checkpoints = self.checkpoints.pending_len(),
            abandoned_records = self.sink.pending_len(),
            "Relay drained, unflushed data abandoned"
        );
        self.transition(RelayState::Closed);
    }

    fn start_sink_schedule(&self) -> PeriodicTask {
        let sink = self.sink.clone();
        PeriodicTask::start(SINK_FLUSH_SCHEDULE, self.sink_flush_interval, move || {
            let sink = sink.clone();
            async move {
                sink.flush();
                Ok::<(), RelayError>(())
            }
        })
    }

    fn start_checkpoint_schedule(&self) -> PeriodicTask {
        let checkpoints = self.checkpoints.clone();
        let metrics = self.metrics.clone();
        PeriodicTask::start(
            CHECKPOINT_FLUSH_SCHEDULE,
            self.checkpoint_flush_interval,
            move || {
                let checkpoints = checkpoints.clone();
                let metrics = metrics.clone();
                async move {
                    let result = checkpoints.flush().await;
                    if let Some(metrics) = &metrics {
                        match &result {
                            Ok(true) => metrics.checkpoint_writes.inc(),
                            Ok(false) => {}
                            Err(_) => metrics.flush_failures.inc(),
                        }
                    }
                    result.map(|_| ())
                }
            },
        )
    }

    fn transition(&mut self, next: RelayState) {
        debug!(from = ?self.state, to = ?next, "Relay state change");
        self.state = next;
        if let Some(metrics) = &self.metrics {
            metrics.relay_state.set(next.as_gauge());
        }
    }
}
