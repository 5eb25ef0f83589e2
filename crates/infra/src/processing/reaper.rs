//! Periodic requeue of tasks stuck in `PROCESSING`.
//!
//! A claim increments `attempts` before the outcome is known, so a process
//! that dies mid-task leaves the row in `PROCESSING`. The reaper moves rows
//! whose `updated_at` is older than the lease back to `FAILED`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::TaskStore;

pub struct StaleTaskReaper<S> {
    store: Arc<S>,
    interval: Duration,
    lease: Duration,
}

impl<S: TaskStore + 'static> StaleTaskReaper<S> {
    pub fn new(store: Arc<S>, interval: Duration, lease: Duration) -> Self {
        Self {
            store,
            interval,
            lease,
        }
    }

    /// One sweep. Returns how many tasks were requeued (0 on error).
    pub async fn sweep(&self) -> u64 {
        match self.store.requeue_stale(self.lease).await {
            Ok(0) => {
                debug!("no stale tasks");
                0
            }
            Ok(requeued) => {
                info!(requeued, lease_secs = self.lease.as_secs(), "requeued stale tasks");
                requeued
            }
            Err(err) => {
                warn!(error = %err, "stale task sweep failed");
                0
            }
        }
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.interval.as_secs(),
                lease_secs = self.lease.as_secs(),
                "stale task reaper started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            info!("stale task reaper stopped");
        })
    }
}
