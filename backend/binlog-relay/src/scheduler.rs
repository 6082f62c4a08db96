//! Fixed-rate background schedules.
//!
//! A [`PeriodicTask`] runs an async action at `start + k * interval` on its own tokio
//! task. Ticks that fall due while the previous invocation is still running are skipped,
//! so invocations of one schedule never overlap and a slow action does not shift the
//! cadence. Failures and panics inside the action are logged and the schedule carries on.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::error::RelayResult;

/// Handle to a running schedule.
pub struct PeriodicTask {
    name: String,
    shutdown: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn a schedule invoking `action` every `period`, first tick one period from now.
    pub fn start<F, Fut>(name: impl Into<String>, period: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RelayResult<()>> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        info!(schedule = %name, interval_secs = period.as_secs_f64(), "Starting schedule");
        let handle = tokio::spawn(run_schedule(name.clone(), period, action, shutdown_rx));

        Self {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop future ticks. An invocation already running is left to finish.
    pub fn cancel(&self) {
        // Err only means the loop already exited.
        let _ = self.shutdown.send(());
    }

    /// Cancel and wait for the schedule's task, including any in-flight invocation.
    pub async fn stop(mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(schedule = %self.name, error = %e, "Schedule task panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_schedule<F, Fut>(
    name: String,
    period: Duration,
    action: F,
    mut shutdown: broadcast::Receiver<()>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RelayResult<()>> + Send + 'static,
{
    let start = Instant::now();
    let mut deadline = start + period;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                debug!(schedule = %name, "Received cancel, stopping schedule");
                break;
            }
            _ = sleep_until(deadline) => {
                match AssertUnwindSafe(action()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(schedule = %name, error = %e, "Scheduled action failed");
                    }
                    Err(_) => {
                        warn!(schedule = %name, "Scheduled action panicked");
                    }
                }
            }
        }

        deadline = next_deadline(start, period, Instant::now());
    }

    info!(schedule = %name, "Schedule stopped");
}

/// First `start + k * period` strictly after `now`; ticks missed while busy are skipped.
fn next_deadline(start: Instant, period: Duration, now: Instant) -> Instant {
    let period_nanos = period.as_nanos().max(1);
    let elapsed = now.saturating_duration_since(start).as_nanos();
    let ticks = elapsed / period_nanos + 1;
    let offset = u64::try_from(ticks * period_nanos).unwrap_or(u64::MAX);
    start + Duration::from_nanos(offset)
}
