//! Sync coordinator that owns the local cache and pushes records to the remote store.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use ledgersync_common::{Collection, Error, Record, RecordDraft, Result};
use ledgersync_storage::{Document, Fields, KeyValueStore, RemoteStore};

use crate::cache::LocalCache;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scheduler::{SyncMode, SyncReport, SyncRequest, SyncScheduler};
use crate::state::{CollectionStats, Envelope, SyncStatistics, SyncStatus};

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Retries per remote call for transient failures.
    pub max_retries: u32,
    /// Pause between two remote calls of a synchronization pass.
    pub sync_delay_ms: u64,
    /// Sync mode.
    pub sync_mode: SyncMode,
    /// Push new records in the background as soon as they are cached.
    pub sync_on_add: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            sync_delay_ms: 100,
            sync_mode: SyncMode::Manual,
            sync_on_add: true,
        }
    }
}

impl SyncConfig {
    /// Load a JSON configuration file. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let config = serde_json::from_slice(&bytes)?;
                debug!("Loaded sync config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.sync_delay_ms)
    }
}

/// Result of pushing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The remote store accepted the record.
    Synced { remote_id: String },
    /// Nothing to do, the record was already synced.
    AlreadySynced,
    /// No cached record with that id.
    NotFound,
    /// Another task is pushing the same record.
    InFlight,
    /// No push was scheduled.
    Deferred,
    /// The remote call failed. The record is kept in ERROR.
    Failed { error: String },
}

/// Result of a local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// The remote copy was updated.
    Synced,
    /// The record has not reached the remote store yet; the next pass pushes the edit.
    Deferred,
    /// The remote update failed. The local edit is kept in ERROR.
    Failed { error: String },
}

/// Result of a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The record never reached the remote store.
    LocalOnly,
    /// The remote copy was deleted as well.
    RemoteDeleted,
    /// The remote delete failed; the local copy is gone anyway.
    RemoteFailed { error: String },
}

/// Result of a bootstrap pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    /// Documents now cached, per collection.
    pub pulled: BTreeMap<Collection, usize>,
    /// Collections whose listing failed and kept their previous cache.
    pub failed: Vec<Collection>,
}

/// Handle on the background push started by [`SyncCoordinator::add_record`].
///
/// Dropping it does not cancel the push.
pub struct SyncHandle {
    task: Option<JoinHandle<Result<SyncOutcome>>>,
}

impl SyncHandle {
    fn deferred() -> Self {
        Self { task: None }
    }

    /// Whether the push has completed (or was never started).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait until the record is durable remotely, or the attempt failed.
    pub async fn wait(self) -> Result<SyncOutcome> {
        match self.task {
            Some(task) => task
                .await
                .map_err(|e| Error::Storage(format!("Sync task did not complete: {}", e)))?,
            None => Ok(SyncOutcome::Deferred),
        }
    }
}

/// A record that has been cached locally.
pub struct AddedRecord {
    /// Local id of the new record.
    pub id: String,
    pub sync: SyncHandle,
}

/// Coordinates the local cache with the remote store.
///
/// Writes land in the local cache first and are pushed afterwards, so every
/// operation keeps working while the remote store is unreachable. Cloning is
/// cheap; clones share the cache, the remote and the in-flight set.
pub struct SyncCoordinator<S: ?Sized> {
    /// Remote document store.
    remote: Arc<dyn RemoteStore>,
    /// Local envelope cache.
    cache: Arc<LocalCache<S>>,
    /// Retry executor for remote calls.
    retry_executor: Arc<RetryExecutor>,
    /// Records currently being pushed.
    in_flight: Arc<Mutex<HashSet<(Collection, String)>>>,
    /// Configuration.
    config: SyncConfig,
}

impl<S: ?Sized> Clone for SyncCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            remote: self.remote.clone(),
            cache: self.cache.clone(),
            retry_executor: self.retry_executor.clone(),
            in_flight: self.in_flight.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: KeyValueStore + ?Sized + 'static> SyncCoordinator<S> {
    /// Create a coordinator on top of a remote store and a local key-value backend.
    pub fn new(remote: Arc<dyn RemoteStore>, store: Arc<S>, config: SyncConfig) -> Self {
        let retry_config = RetryConfig::new(config.max_retries);

        Self {
            remote,
            cache: Arc::new(LocalCache::new(store)),
            retry_executor: Arc::new(RetryExecutor::new(retry_config)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The remote store this coordinator pushes to.
    pub fn remote(&self) -> Arc<dyn RemoteStore> {
        self.remote.clone()
    }

    /// Validate and cache a new record, then push it in the background.
    ///
    /// Returns once the record is persisted locally. The remote push is not
    /// awaited; use [`AddedRecord::sync`] to wait for it.
    ///
    /// # Errors
    /// - Draft fails validation (nothing is written)
    /// - Local cache cannot be written
    pub async fn add_record(&self, collection: Collection, draft: RecordDraft) -> Result<AddedRecord> {
        draft.validate(collection)?;

        let id = mint_local_id();
        let envelope = Envelope::new_pending(draft.into_record(id.clone()));

        self.cache
            .mutate(collection, move |list| {
                list.insert(0, envelope);
                Ok(())
            })
            .await?;

        info!("Cached new {} record {}", collection, id);

        let sync = if self.config.sync_on_add {
            let coordinator = self.clone();
            let record_id = id.clone();
            SyncHandle {
                task: Some(tokio::spawn(async move {
                    coordinator.sync_one_record(collection, &record_id).await
                })),
            }
        } else {
            SyncHandle::deferred()
        };

        Ok(AddedRecord { id, sync })
    }

    /// Push one cached record to the remote store.
    ///
    /// Records without a remote id are created, the others are updated. A
    /// synced record is left alone without any remote call. A failed call
    /// leaves the record cached in ERROR and is reported as
    /// [`SyncOutcome::Failed`], not as an error.
    ///
    /// # Errors
    /// - Local cache cannot be written
    pub async fn sync_one_record(&self, collection: Collection, id: &str) -> Result<SyncOutcome> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, collection, id) else {
            debug!("Record {} in {} is already being pushed", id, collection);
            return Ok(SyncOutcome::InFlight);
        };

        self.push_record(collection, id).await
    }

    async fn push_record(&self, collection: Collection, id: &str) -> Result<SyncOutcome> {
        let Some(envelope) = self.find(collection, id).await else {
            return Ok(SyncOutcome::NotFound);
        };
        if envelope.sync_status == SyncStatus::Synced {
            debug!("Record {} in {} is already synced", id, collection);
            return Ok(SyncOutcome::AlreadySynced);
        }

        let pushed = envelope.record;
        let updating = pushed.remote_id.is_some();
        let result = match pushed.remote_id.clone() {
            Some(remote_id) => {
                let fields = pushed.to_update_fields()?;
                self.remote_update(collection, &remote_id, fields)
                    .await
                    .map(|()| remote_id)
            }
            None => {
                let fields = pushed.to_fields()?;
                self.remote_create(collection, fields).await
            }
        };

        match result {
            Ok(remote_id) => {
                let stored_id = remote_id.clone();
                let still_cached = self
                    .cache
                    .mutate(collection, move |list| {
                        let Some(current) = list.iter_mut().find(|e| e.id() == id) else {
                            return Ok(false);
                        };
                        if same_content(&current.record, &pushed) {
                            current.mark_synced(stored_id);
                        } else {
                            // Edited while the call was in flight; the next pass pushes the edit
                            current.record.remote_id = Some(stored_id);
                        }
                        Ok(true)
                    })
                    .await?;

                if !still_cached {
                    warn!(
                        "Record {} was deleted from {} while being pushed, removing remote copy {}",
                        id, collection, remote_id
                    );
                    if let Err(e) = self.remote_delete(collection, &remote_id).await {
                        warn!("Failed to remove orphaned remote document {}: {}", remote_id, e);
                    }
                    return Ok(SyncOutcome::NotFound);
                }

                info!("Synced {} record {} as {}", collection, id, remote_id);
                Ok(SyncOutcome::Synced { remote_id })
            }
            Err(e) => {
                warn!("Failed to sync {} record {}: {}", collection, id, e);
                // The remote copy is gone; the next pass creates a new one
                let recreate = updating && matches!(e, Error::NotFound(_));
                let message = e.to_string();
                let recorded = message.clone();
                self.cache
                    .mutate(collection, move |list| {
                        if let Some(current) = list.iter_mut().find(|e| e.id() == id) {
                            if recreate {
                                current.record.remote_id = None;
                            }
                            current.mark_failed(recorded);
                        }
                        Ok(())
                    })
                    .await?;
                Ok(SyncOutcome::Failed { error: message })
            }
        }
    }

    /// Replace every cached collection with the remote contents.
    ///
    /// Meant for bootstrapping a fresh device: unsynced local records are
    /// discarded (with a warning). A collection whose listing fails keeps
    /// its cache untouched.
    ///
    /// # Errors
    /// - Local cache cannot be written
    pub async fn pull_all_from_remote(&self) -> Result<PullSummary> {
        let mut summary = PullSummary::default();

        for collection in Collection::ALL {
            let mut documents = match self.remote_list(collection).await {
                Ok(documents) => documents,
                Err(e) => {
                    error!("Failed to list {} from remote: {}", collection, e);
                    summary.failed.push(collection);
                    continue;
                }
            };
            // Newest first, like records added locally
            documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            let envelopes: Vec<Envelope> = documents
                .iter()
                .filter_map(|doc| match Envelope::from_document(doc) {
                    Ok(envelope) => Some(envelope),
                    Err(e) => {
                        warn!("Skipping malformed document {} in {}: {}", doc.id, collection, e);
                        None
                    }
                })
                .collect();
            let count = envelopes.len();

            let discarded = self
                .cache
                .mutate(collection, move |list| {
                    let discarded = list.iter().filter(|e| e.is_eligible()).count();
                    *list = envelopes;
                    Ok(discarded)
                })
                .await?;

            if discarded > 0 {
                warn!(
                    "Pull discarded {} unsynced records from {}",
                    discarded, collection
                );
            }
            debug!("Pulled {} documents into {}", count, collection);
            summary.pulled.insert(collection, count);
        }

        info!(
            "Pull completed: {} documents, {} collections failed",
            summary.pulled.values().sum::<usize>(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Push every PENDING or ERROR record of every collection.
    pub async fn sync_all_pending(&self) -> Result<SyncReport> {
        self.sync_pending_in(&Collection::ALL).await
    }

    /// Push every PENDING or ERROR record of the given collections.
    ///
    /// Records are pushed one at a time with [`SyncConfig::sync_delay`]
    /// between calls. Per-record failures are counted, not returned.
    pub async fn sync_pending_in(&self, collections: &[Collection]) -> Result<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport::default();
        let mut first = true;

        for &collection in collections {
            let ids: Vec<String> = self
                .cache
                .load(collection)
                .await
                .iter()
                .filter(|e| e.is_eligible())
                .map(|e| e.id().to_string())
                .collect();

            for id in ids {
                if !first && self.config.sync_delay_ms > 0 {
                    sleep(self.config.sync_delay()).await;
                }
                first = false;

                match self.sync_one_record(collection, &id).await {
                    Ok(SyncOutcome::Synced { .. }) => report.synced += 1,
                    Ok(SyncOutcome::Failed { .. }) => report.failed += 1,
                    Ok(_) => report.skipped += 1,
                    Err(e) => {
                        error!("Failed to sync {} record {}: {}", collection, id, e);
                        report.failed += 1;
                    }
                }
            }
        }

        report.duration = start.elapsed();
        info!(
            "Sync pass completed in {:?}: {} synced, {} failed, {} skipped",
            report.duration, report.synced, report.failed, report.skipped
        );
        Ok(report)
    }

    /// Process a sync request (for scheduler).
    pub async fn process_request(&self, request: SyncRequest) -> Result<SyncReport> {
        match request {
            SyncRequest::All => self.sync_all_pending().await,
            SyncRequest::Collections(collections) => self.sync_pending_in(&collections).await,
            SyncRequest::Shutdown => Ok(SyncReport::default()),
        }
    }

    /// Start a scheduler that runs sync passes for this coordinator.
    ///
    /// The background task runs until [`SyncScheduler::shutdown`] is called
    /// or every scheduler handle is dropped.
    pub fn spawn_scheduler(&self) -> (SyncScheduler, JoinHandle<()>) {
        let (scheduler, handle) = SyncScheduler::new(self.config.sync_mode.clone());
        let coordinator = self.clone();

        let task = tokio::spawn(handle.run(move |request| {
            let coordinator = coordinator.clone();
            async move { coordinator.process_request(request).await }
        }));

        (scheduler, task)
    }

    /// Delete a record locally, and remotely if it has reached the remote store.
    ///
    /// The local copy is removed even when the remote delete fails.
    ///
    /// # Errors
    /// - No cached record with that id
    /// - Local cache cannot be written
    pub async fn delete_record(&self, collection: Collection, id: &str) -> Result<DeleteOutcome> {
        let envelope = self
            .find(collection, id)
            .await
            .ok_or_else(|| Error::NotFound(format!("No record {} in {}", id, collection)))?;

        let outcome = match envelope.record.remote_id {
            Some(remote_id) => match self.remote_delete(collection, &remote_id).await {
                Ok(()) => DeleteOutcome::RemoteDeleted,
                Err(e) => {
                    warn!(
                        "Failed to delete remote copy {} of {} record {}: {}",
                        remote_id, collection, id, e
                    );
                    DeleteOutcome::RemoteFailed {
                        error: e.to_string(),
                    }
                }
            },
            None => DeleteOutcome::LocalOnly,
        };

        self.cache
            .mutate(collection, |list| {
                list.retain(|e| e.id() != id);
                Ok(())
            })
            .await?;

        info!("Deleted {} record {}", collection, id);
        Ok(outcome)
    }

    /// Replace the fields of a cached record and push the change if possible.
    ///
    /// # Errors
    /// - Draft fails validation (nothing is written)
    /// - No cached record with that id
    /// - Local cache cannot be written
    pub async fn edit_record(
        &self,
        collection: Collection,
        id: &str,
        draft: RecordDraft,
    ) -> Result<EditOutcome> {
        draft.validate(collection)?;

        let has_remote = self
            .cache
            .mutate(collection, move |list| {
                let envelope = list
                    .iter_mut()
                    .find(|e| e.id() == id)
                    .ok_or_else(|| Error::NotFound(format!("No record {} in {}", id, collection)))?;
                envelope.record.apply(draft);
                envelope.mark_pending();
                Ok(envelope.record.remote_id.is_some())
            })
            .await?;

        debug!("Edited {} record {}", collection, id);

        if !has_remote {
            return Ok(EditOutcome::Deferred);
        }

        match self.sync_one_record(collection, id).await? {
            SyncOutcome::Synced { .. } | SyncOutcome::AlreadySynced => Ok(EditOutcome::Synced),
            SyncOutcome::Failed { error } => Ok(EditOutcome::Failed { error }),
            SyncOutcome::NotFound => Err(Error::NotFound(format!(
                "Record {} was removed from {} during the edit",
                id, collection
            ))),
            SyncOutcome::InFlight | SyncOutcome::Deferred => Ok(EditOutcome::Deferred),
        }
    }

    /// Cached records of a collection, most recent first.
    pub async fn read_for_ui(&self, collection: Collection) -> Vec<Record> {
        self.cache
            .load(collection)
            .await
            .into_iter()
            .map(|e| e.record)
            .collect()
    }

    /// Cached records whose date lies within `[from, to]`, most recent first.
    pub async fn read_by_date_range(
        &self,
        collection: Collection,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Record> {
        self.read_for_ui(collection)
            .await
            .into_iter()
            .filter(|r| r.date >= from && r.date <= to)
            .collect()
    }

    /// Cached envelopes of a collection, sync metadata included.
    pub async fn envelopes(&self, collection: Collection) -> Vec<Envelope> {
        self.cache.load(collection).await
    }

    /// Per-collection sync counters.
    pub async fn sync_statistics(&self) -> SyncStatistics {
        let mut statistics = SyncStatistics::new();
        for collection in Collection::ALL {
            let envelopes = self.cache.load(collection).await;
            statistics.insert(collection, CollectionStats::from_envelopes(&envelopes));
        }
        statistics
    }

    async fn find(&self, collection: Collection, id: &str) -> Option<Envelope> {
        self.cache
            .load(collection)
            .await
            .into_iter()
            .find(|e| e.id() == id)
    }

    async fn remote_create(&self, collection: Collection, fields: Fields) -> Result<String> {
        let remote = self.remote.clone();
        self.retry_executor
            .execute(move || {
                let r = remote.clone();
                let f = fields.clone();
                async move { r.create(collection, f).await }
            })
            .await
    }

    async fn remote_update(&self, collection: Collection, id: &str, fields: Fields) -> Result<()> {
        let remote = self.remote.clone();
        let id = id.to_string();
        self.retry_executor
            .execute(move || {
                let r = remote.clone();
                let id = id.clone();
                let f = fields.clone();
                async move { r.update(collection, &id, f).await }
            })
            .await
    }

    async fn remote_delete(&self, collection: Collection, id: &str) -> Result<()> {
        let remote = self.remote.clone();
        let id = id.to_string();
        self.retry_executor
            .execute(move || {
                let r = remote.clone();
                let id = id.clone();
                async move { r.delete(collection, &id).await }
            })
            .await
    }

    async fn remote_list(&self, collection: Collection) -> Result<Vec<Document>> {
        let remote = self.remote.clone();
        self.retry_executor
            .execute(move || {
                let r = remote.clone();
                async move { r.list_all(collection).await }
            })
            .await
    }
}

/// Marks a record as being pushed until dropped.
///
/// Removal happens on drop so a cancelled push does not block later ones.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<(Collection, String)>>>,
    key: (Collection, String),
}

impl InFlightGuard {
    fn acquire(
        set: &Arc<Mutex<HashSet<(Collection, String)>>>,
        collection: Collection,
        id: &str,
    ) -> Option<Self> {
        let key = (collection, id.to_string());
        let inserted = set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone());
        inserted.then(|| Self {
            set: set.clone(),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

/// Whether two records carry the same domain content, ignoring the remote id.
fn same_content(current: &Record, pushed: &Record) -> bool {
    current.amount == pushed.amount
        && current.date == pushed.date
        && current.category == pushed.category
        && current.description == pushed.description
        && current.supplier == pushed.supplier
        && current.notes == pushed.notes
}

/// Mint a local id: millisecond timestamp plus a random base-36 suffix.
fn mint_local_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let mut bits = rand::random::<u64>();
    let mut suffix = String::with_capacity(9);
    for _ in 0..9 {
        let digit = (bits % 36) as u32;
        suffix.push(char::from_digit(digit, 36).unwrap_or('0'));
        bits /= 36;
    }
    format!("{}-{}", millis, suffix)
}
