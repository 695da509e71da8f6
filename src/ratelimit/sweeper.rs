//! Background eviction of expired fallback counters.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use super::memory::InMemoryBackend;

/// Default time between sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically removes expired entries from a fallback map.
///
/// Removal goes through `InMemoryBackend::sweep`, which takes the same shard
/// locks as `increment`, so a sweep never races an update of the same key.
pub struct CleanupSweeper;

impl CleanupSweeper {
    /// Start sweeping `fallback` every `interval` on the current runtime.
    pub fn spawn(fallback: Arc<InMemoryBackend>, interval: Duration) -> SweeperHandle {
        let interval = interval.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        info!(interval_ms = interval.as_millis() as u64, "Starting fallback cleanup sweeper");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let removed = fallback.sweep();
                        if removed > 0 {
                            debug!(
                                removed = removed,
                                remaining = fallback.len(),
                                "Swept expired fallback counters"
                            );
                        } else {
                            trace!(remaining = fallback.len(), "Sweep found nothing to remove");
                        }
                    }
                }
            }

            debug!("Fallback cleanup sweeper stopped");
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Handle to a running sweeper. Dropping it aborts the task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Whether the sweeper task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Fallback cleanup sweeper terminated abnormally");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
