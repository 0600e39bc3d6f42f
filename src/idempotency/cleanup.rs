use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::idempotency::clock::Clock;
use crate::idempotency::store::IdempotencyStore;
use crate::observability::get_metrics;

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CLEANUP_BATCH_SIZE: usize = 500;

/// Background sweep deleting expired idempotency records.
pub struct CleanupJob {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: usize,
}

impl CleanupJob {
    pub fn new(store: Arc<dyn IdempotencyStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            interval: DEFAULT_CLEANUP_INTERVAL,
            batch_size: DEFAULT_CLEANUP_BATCH_SIZE,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Runs one sweep.
    pub async fn run_once(&self) -> Result<u64> {
        let removed = self
            .store
            .cleanup_expired(self.clock.now(), self.batch_size)
            .await?;
        get_metrics().record_idempotency_cleanup(removed);
        Ok(removed)
    }

    /// Starts the sweep in a background task.
    ///
    /// The task stops when [`CleanupHandle::shutdown`] is called or the handle
    /// is dropped.
    pub fn start(self) -> CleanupHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                // Dropping the sweep future on shutdown cancels the in-flight store call.
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    result = self.run_once() => match result {
                        Ok(count) => {
                            if count > 0 {
                                tracing::info!("Cleaned up {} expired idempotency records", count);
                            }
                        }
                        Err(e) => {
                            tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                        }
                    },
                }
            }

            tracing::debug!(store = self.store.name(), "Idempotency cleanup job stopped");
        });

        CleanupHandle { shutdown_tx, task }
    }
}

/// Handle to a running [`CleanupJob`].
pub struct CleanupHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Stops the ticker, cancels any in-flight sweep and waits for the task to
    /// exit. Call before closing the store's connection pool.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Idempotency cleanup task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::clock::ManualClock;
    use crate::idempotency::memory::InMemoryStore;
    use crate::idempotency::store::IdempotencyStore as _;
    use chrono::Utc;

    #[tokio::test]
    async fn test_run_once_respects_batch_size() {
        let store = Arc::new(InMemoryStore::new());
        let start = Utc::now();
        for i in 0..5 {
            store
                .reserve(&format!("k{}", i), "fp", start, chrono::Duration::seconds(1))
                .await
                .unwrap();
        }

        let clock = Arc::new(ManualClock::new(start + chrono::Duration::seconds(2)));
        let job = CleanupJob::new(store.clone(), clock).with_batch_size(3);

        assert_eq!(job.run_once().await.unwrap(), 3);
        assert_eq!(job.run_once().await.unwrap(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let handle = CleanupJob::new(store, clock)
            .with_interval(Duration::from_millis(10))
            .start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }
}
