//! Per-record sync state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use ledgersync_common::{Collection, Record, Result};
use ledgersync_storage::Document;

/// Sync status for a single cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Created or edited locally, not yet confirmed by the remote store.
    Pending,
    /// Remote store holds the current version.
    Synced,
    /// Last sync attempt failed; eligible for retry.
    Error,
}

/// A cached record plus its synchronization bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub record: Record,
    /// Current sync status.
    pub sync_status: SyncStatus,
    /// Last successful sync time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Last error message if failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    /// Number of consecutive failed sync attempts.
    #[serde(default)]
    pub failure_count: u32,
}

impl Envelope {
    /// Wrap a freshly submitted record.
    pub fn new_pending(record: Record) -> Self {
        Self {
            record,
            sync_status: SyncStatus::Pending,
            last_sync_at: None,
            sync_error: None,
            failure_count: 0,
        }
    }

    /// Build a synced envelope from a remote document.
    ///
    /// The remote id doubles as the local id for records that were never
    /// created on this device.
    pub fn from_document(document: &Document) -> Result<Self> {
        let mut record: Record = serde_json::from_value(document.materialize())?;
        record.remote_id = Some(document.id.clone());

        Ok(Self {
            record,
            sync_status: SyncStatus::Synced,
            last_sync_at: Some(Utc::now()),
            sync_error: None,
            failure_count: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Whether a synchronization pass should pick this envelope up.
    pub fn is_eligible(&self) -> bool {
        matches!(self.sync_status, SyncStatus::Pending | SyncStatus::Error)
    }

    /// Mark as synced successfully.
    pub fn mark_synced(&mut self, remote_id: impl Into<String>) {
        self.record.remote_id = Some(remote_id.into());
        self.sync_status = SyncStatus::Synced;
        self.last_sync_at = Some(Utc::now());
        self.sync_error = None;
        self.failure_count = 0;
    }

    /// Mark as failed. The record stays cached for a later retry.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.sync_status = SyncStatus::Error;
        self.sync_error = Some(error.into());
        self.failure_count += 1;
    }

    /// Mark local changes as not yet pushed.
    pub fn mark_pending(&mut self) {
        self.sync_status = SyncStatus::Pending;
    }
}

/// Sync counters for one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total: usize,
    pub synced: usize,
    pub pending: usize,
    pub error: usize,
}

impl CollectionStats {
    /// Count envelopes by status.
    pub fn from_envelopes(envelopes: &[Envelope]) -> Self {
        let mut stats = Self::default();
        for envelope in envelopes {
            stats.total += 1;
            match envelope.sync_status {
                SyncStatus::Synced => stats.synced += 1,
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::Error => stats.error += 1,
            }
        }
        stats
    }

    /// Check if there are records not yet confirmed remotely.
    pub fn has_unsynced(&self) -> bool {
        self.pending + self.error > 0
    }
}

/// Sync counters for every collection.
pub type SyncStatistics = BTreeMap<Collection, CollectionStats>;
