//! Ledgersync Sync Engine
//!
//! This module keeps ledger records usable offline and pushes them to a
//! remote document store when it is reachable:
//! - Local cache of records with per-record sync state
//! - Sync coordinator for add, edit, delete, push and pull
//! - Retry strategy with exponential backoff
//! - Manual and periodic background sync
//! - Live query subscriptions with full-snapshot delivery

pub mod cache;
pub mod engine;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod subscription;
pub mod views;

// Re-export main types
pub use cache::{LocalCache, CACHE_FORMAT_VERSION};
pub use engine::{
    AddedRecord, DeleteOutcome, EditOutcome, PullSummary, SyncConfig, SyncCoordinator, SyncHandle,
    SyncOutcome,
};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncReport, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{CollectionStats, Envelope, SyncStatistics, SyncStatus};
pub use subscription::{
    Subscription, SubscriptionChannel, SubscriptionSpec, SubscriptionState, Transform,
};
