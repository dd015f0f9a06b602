//! End-to-end behavior of the coordinator against the in-memory remote.

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use ledgersync_common::{Category, Collection, RecordDraft};
use ledgersync_storage::{Document, FileKv, MemoryKv, MemoryRemote, Query, RemoteStore};
use ledgersync_sync::{
    CollectionStats, DeleteOutcome, SubscriptionChannel, SubscriptionSpec, SyncConfig,
    SyncCoordinator, SyncOutcome, SyncStatus,
};

fn jan_15() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
}

fn manual_config() -> SyncConfig {
    SyncConfig {
        sync_delay_ms: 0,
        sync_on_add: false,
        ..SyncConfig::default()
    }
}

fn coordinator(remote: &MemoryRemote, config: SyncConfig) -> SyncCoordinator<MemoryKv> {
    SyncCoordinator::new(Arc::new(remote.clone()), Arc::new(MemoryKv::new()), config)
}

fn income_stats(stats: &ledgersync_sync::SyncStatistics) -> CollectionStats {
    stats[&Collection::Income]
}

#[tokio::test]
async fn income_record_survives_outage_and_syncs_later() {
    let remote = MemoryRemote::new();
    remote.set_offline(true).await;
    let coordinator = coordinator(&remote, manual_config());

    coordinator
        .add_record(Collection::Income, RecordDraft::new(500.0, jan_15(), Category::Other))
        .await
        .unwrap();

    let records = coordinator.read_for_ui(Collection::Income).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].amount, 500.0);
    assert_eq!(records[0].category, Category::Other);
    assert_eq!(records[0].date, jan_15());

    let stats = coordinator.sync_statistics().await;
    assert_eq!(
        income_stats(&stats),
        CollectionStats { total: 1, synced: 0, pending: 1, error: 0 }
    );

    remote.set_offline(false).await;
    let report = coordinator.sync_all_pending().await.unwrap();
    assert_eq!(report.synced, 1);

    let stats = coordinator.sync_statistics().await;
    assert_eq!(
        income_stats(&stats),
        CollectionStats { total: 1, synced: 1, pending: 0, error: 0 }
    );
    assert_eq!(remote.count(Collection::Income).await, 1);
}

#[tokio::test]
async fn background_sync_failure_lands_in_error() {
    let remote = MemoryRemote::new();
    remote.set_offline(true).await;
    let coordinator = coordinator(
        &remote,
        SyncConfig {
            sync_delay_ms: 0,
            ..SyncConfig::default()
        },
    );

    let added = coordinator
        .add_record(Collection::Income, RecordDraft::new(500.0, jan_15(), Category::Other))
        .await
        .unwrap();
    let outcome = added.sync.wait().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Failed { .. }));

    let envelope = &coordinator.envelopes(Collection::Income).await[0];
    assert_eq!(envelope.sync_status, SyncStatus::Error);
    assert!(envelope.sync_error.is_some());

    let stats = coordinator.sync_statistics().await;
    assert_eq!(income_stats(&stats).error, 1);
}

#[tokio::test]
async fn synced_record_is_not_pushed_again() {
    let remote = MemoryRemote::new();
    let coordinator = coordinator(&remote, manual_config());

    let added = coordinator
        .add_record(Collection::Expenses, RecordDraft::new(20.0, jan_15(), Category::Rent))
        .await
        .unwrap();
    let first = coordinator
        .sync_one_record(Collection::Expenses, &added.id)
        .await
        .unwrap();
    assert!(matches!(first, SyncOutcome::Synced { .. }));
    assert_eq!(remote.create_attempts().await, 1);

    let second = coordinator
        .sync_one_record(Collection::Expenses, &added.id)
        .await
        .unwrap();
    assert_eq!(second, SyncOutcome::AlreadySynced);
    assert_eq!(remote.create_attempts().await, 1);

    let report = coordinator.sync_all_pending().await.unwrap();
    assert_eq!(report.attempted(), 0);
    assert_eq!(remote.create_attempts().await, 1);
}

#[tokio::test]
async fn repeated_passes_create_exactly_once() {
    for failures in 1..=4u32 {
        let remote = MemoryRemote::new();
        let coordinator = coordinator(&remote, manual_config());
        coordinator
            .add_record(Collection::Savings, RecordDraft::new(1.0, jan_15(), Category::Investment))
            .await
            .unwrap();

        remote.fail_next(failures - 1).await;
        for _ in 0..failures + 2 {
            coordinator.sync_all_pending().await.unwrap();
        }

        assert_eq!(remote.count(Collection::Savings).await, 1);
        assert_eq!(u64::from(failures), remote.create_attempts().await);
        let envelope = &coordinator.envelopes(Collection::Savings).await[0];
        assert_eq!(envelope.sync_status, SyncStatus::Synced);
    }
}

#[tokio::test]
async fn in_call_retries_recover_transient_failures() {
    let remote = MemoryRemote::new();
    let coordinator = coordinator(
        &remote,
        SyncConfig {
            max_retries: 3,
            sync_delay_ms: 0,
            sync_on_add: false,
            ..SyncConfig::default()
        },
    );
    coordinator
        .add_record(Collection::Income, RecordDraft::new(3.0, jan_15(), Category::Salary))
        .await
        .unwrap();

    remote.fail_next(2).await;
    let report = coordinator.sync_all_pending().await.unwrap();

    assert_eq!(report.synced, 1);
    assert_eq!(remote.create_attempts().await, 3);
    assert_eq!(remote.count(Collection::Income).await, 1);
}

#[tokio::test]
async fn local_delete_wins_when_remote_fails() {
    let remote = MemoryRemote::new();
    let coordinator = coordinator(&remote, manual_config());

    let added = coordinator
        .add_record(Collection::Expenses, RecordDraft::new(9.0, jan_15(), Category::Utilities))
        .await
        .unwrap();
    coordinator.sync_all_pending().await.unwrap();

    remote.set_offline(true).await;
    let outcome = coordinator
        .delete_record(Collection::Expenses, &added.id)
        .await
        .unwrap();
    assert!(matches!(outcome, DeleteOutcome::RemoteFailed { .. }));
    assert!(coordinator.read_for_ui(Collection::Expenses).await.is_empty());

    // The remote copy survives the failed delete
    remote.set_offline(false).await;
    assert_eq!(remote.count(Collection::Expenses).await, 1);
}

#[tokio::test]
async fn delete_of_synced_record_reaches_remote() {
    let remote = MemoryRemote::new();
    let coordinator = coordinator(&remote, manual_config());

    let added = coordinator
        .add_record(Collection::Expenses, RecordDraft::new(9.0, jan_15(), Category::Utilities))
        .await
        .unwrap();
    coordinator.sync_all_pending().await.unwrap();

    let outcome = coordinator
        .delete_record(Collection::Expenses, &added.id)
        .await
        .unwrap();
    assert_eq!(outcome, DeleteOutcome::RemoteDeleted);
    assert_eq!(remote.count(Collection::Expenses).await, 0);
}

#[tokio::test]
async fn pull_into_empty_cache_mirrors_remote() {
    let remote = MemoryRemote::new();
    for (i, amount) in [100.0, 200.0, 300.0].into_iter().enumerate() {
        let fields = serde_json::json!({
            "amount": amount,
            "date": format!("2024-0{}-01T00:00:00Z", i + 1),
            "category": "Salary"
        });
        remote
            .create(Collection::Income, fields.as_object().cloned().unwrap())
            .await
            .unwrap();
    }
    let coordinator = coordinator(&remote, manual_config());

    let summary = coordinator.pull_all_from_remote().await.unwrap();
    assert_eq!(summary.pulled[&Collection::Income], 3);
    assert!(summary.failed.is_empty());

    let envelopes = coordinator.envelopes(Collection::Income).await;
    assert_eq!(envelopes.len(), 3);
    assert!(envelopes.iter().all(|e| e.sync_status == SyncStatus::Synced));

    let remote_ids: Vec<String> = remote
        .list_all(Collection::Income)
        .await
        .unwrap()
        .into_iter()
        .map(|doc| doc.id)
        .collect();
    for envelope in &envelopes {
        assert!(remote_ids.contains(&envelope.id().to_string()));
        assert_eq!(envelope.record.remote_id.as_deref(), Some(envelope.id()));
    }
}

#[tokio::test]
async fn pull_skips_malformed_documents() {
    let remote = MemoryRemote::new();
    remote
        .seed(Collection::Notes, Document::new("broken", Default::default()))
        .await;
    let coordinator = coordinator(&remote, manual_config());

    let summary = coordinator.pull_all_from_remote().await.unwrap();
    assert_eq!(summary.pulled[&Collection::Notes], 0);
    assert!(coordinator.read_for_ui(Collection::Notes).await.is_empty());
}

#[tokio::test]
async fn failed_pull_keeps_cache() {
    let remote = MemoryRemote::new();
    let coordinator = coordinator(&remote, manual_config());
    coordinator
        .add_record(Collection::Income, RecordDraft::new(1.0, jan_15(), Category::Salary))
        .await
        .unwrap();

    remote.set_offline(true).await;
    let summary = coordinator.pull_all_from_remote().await.unwrap();

    assert_eq!(summary.failed.len(), Collection::ALL.len());
    assert_eq!(coordinator.read_for_ui(Collection::Income).await.len(), 1);
}

#[tokio::test]
async fn cache_survives_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MemoryRemote::new();
    remote.set_offline(true).await;

    let added = {
        let coordinator = SyncCoordinator::new(
            Arc::new(remote.clone()),
            Arc::new(FileKv::new(dir.path()).unwrap()),
            manual_config(),
        );
        coordinator
            .add_record(
                Collection::SupplierInvoices,
                RecordDraft::new(75.0, jan_15(), Category::Supplies).with_supplier("ACME"),
            )
            .await
            .unwrap()
    };

    let coordinator = SyncCoordinator::new(
        Arc::new(remote.clone()),
        Arc::new(FileKv::new(dir.path()).unwrap()),
        manual_config(),
    );
    let records = coordinator.read_for_ui(Collection::SupplierInvoices).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, added.id);
    assert_eq!(records[0].supplier.as_deref(), Some("ACME"));

    remote.set_offline(false).await;
    coordinator.sync_all_pending().await.unwrap();
    assert_eq!(remote.count(Collection::SupplierInvoices).await, 1);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Invoice {
    amount: f64,
    supplier: String,
}

#[tokio::test]
async fn subscription_sees_synced_records() {
    let remote = MemoryRemote::new();
    let coordinator = coordinator(
        &remote,
        SyncConfig {
            sync_delay_ms: 0,
            ..SyncConfig::default()
        },
    );

    let channel = SubscriptionChannel::new(coordinator.remote());
    let mut sub = channel.subscribe(SubscriptionSpec::<Invoice>::new(Query::new(
        Collection::SupplierInvoices,
    )));

    let added = coordinator
        .add_record(
            Collection::SupplierInvoices,
            RecordDraft::new(42.0, jan_15(), Category::Supplies).with_supplier("ACME"),
        )
        .await
        .unwrap();
    added.sync.wait().await.unwrap();

    let state = tokio::time::timeout(
        Duration::from_secs(5),
        sub.wait_for(|s| s.data.len() == 1),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(state.data[0].amount, 42.0);
    assert_eq!(state.data[0].supplier, "ACME");
}
