//! Sync scheduling - manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use ledgersync_common::{Collection, Error, Result};

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum SyncMode {
    /// Sync only when requested.
    Manual,
    /// Sync pending records at regular intervals.
    Periodic { interval_secs: u64 },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval_secs } => Some(Duration::from_secs((*interval_secs).max(1))),
        }
    }
}

/// Sync request types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// Push pending records of every collection.
    All,
    /// Push pending records of the given collections only.
    Collections(Vec<Collection>),
    /// Shutdown the scheduler.
    Shutdown,
}

/// Outcome of a synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Envelopes now confirmed by the remote store.
    pub synced: usize,
    /// Envelopes whose attempt failed and remain in ERROR.
    pub failed: usize,
    /// Envelopes skipped because they vanished or were already in flight.
    pub skipped: usize,
    pub duration: Duration,
}

impl SyncReport {
    /// Number of envelopes that were looked at.
    pub fn attempted(&self) -> usize {
        self.synced + self.failed + self.skipped
    }
}

type Envelope = (SyncRequest, oneshot::Sender<Result<SyncReport>>);

/// Scheduler for managing sync timing and requests.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<Envelope>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    ///
    /// The returned handle must be run (usually in a spawned task) for
    /// requests to be served.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(32);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Request a pass over every collection and wait for its report.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        self.request(SyncRequest::All).await
    }

    /// Request a pass over specific collections.
    pub async fn request_collections_sync(&self, collections: Vec<Collection>) -> Result<SyncReport> {
        self.request(SyncRequest::Collections(collections)).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Storage("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Storage("Failed to receive sync report".to_string()))?
    }

    /// Change the sync mode. Takes effect after the current wait.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the background task.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        // A closed channel means the task is already gone
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<Envelope>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `sync_fn` is called for every
    /// explicit request and on every periodic tick. The task ends on a
    /// shutdown request or when every [`SyncScheduler`] has been dropped.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SyncReport>> + Send,
    {
        let mut current = self.mode.read().await.interval();
        let mut ticker = current.map(make_interval);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((request, response_tx)) = request else {
                        info!("All scheduler handles dropped, stopping");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        break;
                    }

                    debug!("Processing sync request: {:?}", request);
                    let result = sync_fn(request).await;
                    // The requester may have given up waiting
                    let _ = response_tx.send(result);
                }

                _ = wait_for_tick(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    match sync_fn(SyncRequest::All).await {
                        Ok(report) => info!(
                            "Periodic sync completed: {} synced, {} failed",
                            report.synced, report.failed
                        ),
                        Err(e) => error!("Periodic sync failed: {}", e),
                    }
                }
            }

            // Recreate the ticker if the mode changed
            let expected = self.mode.read().await.interval();
            if expected != current {
                debug!("Sync interval changed to {:?}", expected);
                current = expected;
                ticker = current.map(make_interval);
            }
        }
    }
}

fn make_interval(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it
    ticker.reset();
    ticker
}

async fn wait_for_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
