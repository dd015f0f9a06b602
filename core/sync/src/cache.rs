//! Local cache of envelopes, one entry per collection.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use ledgersync_common::{Collection, Error, Result};
use ledgersync_storage::KeyValueStore;

use crate::state::Envelope;

/// Current cache payload format.
///
/// Payloads are stored as `{"version": 1, "envelopes": [...]}`. A bare
/// envelope array is the untagged legacy layout and is still read.
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct CachePayload<'a> {
    version: u32,
    envelopes: &'a [Envelope],
}

/// Local persistent cache.
///
/// Reads never fail: a missing, unreadable or corrupt entry loads as an
/// empty list. Writes propagate as [`Error::Storage`].
///
/// Read-modify-write sequences go through [`LocalCache::mutate`], which
/// holds a per-collection lock so concurrent writers cannot lose updates.
pub struct LocalCache<S: ?Sized> {
    store: Arc<S>,
    locks: HashMap<Collection, Arc<Mutex<()>>>,
}

impl<S: KeyValueStore + ?Sized> LocalCache<S> {
    /// Create a cache on top of a key-value backend.
    pub fn new(store: Arc<S>) -> Self {
        let locks = Collection::ALL
            .into_iter()
            .map(|c| (c, Arc::new(Mutex::new(()))))
            .collect();
        Self { store, locks }
    }

    /// Load the envelopes of a collection, most recent first.
    pub async fn load(&self, collection: Collection) -> Vec<Envelope> {
        match self.store.get(&collection.cache_key()).await {
            Ok(Some(bytes)) => decode(collection, &bytes),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read cache for {}: {}", collection, e);
                Vec::new()
            }
        }
    }

    /// Persist the envelopes of a collection.
    ///
    /// # Errors
    /// - Backend write failure, reported as [`Error::Storage`]
    pub async fn save(&self, collection: Collection, envelopes: &[Envelope]) -> Result<()> {
        let payload = CachePayload {
            version: CACHE_FORMAT_VERSION,
            envelopes,
        };
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| Error::Storage(format!("Failed to encode {}: {}", collection, e)))?;

        self.store
            .put(&collection.cache_key(), bytes)
            .await
            .map_err(|e| match e {
                Error::Storage(_) => e,
                other => Error::Storage(other.to_string()),
            })?;

        debug!("Saved {} envelopes for {}", envelopes.len(), collection);
        Ok(())
    }

    /// Run a read-modify-write sequence on one collection.
    ///
    /// The list is loaded, handed to `f`, and saved back if `f` succeeds.
    /// Other mutations of the same collection wait until this one is done.
    /// Unlike [`load`](Self::load), a backend read failure aborts the
    /// mutation rather than overwriting the entry with an empty list.
    ///
    /// # Errors
    /// - Backend read or write failure
    /// - Whatever `f` returns
    pub async fn mutate<F, T>(&self, collection: Collection, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Envelope>) -> Result<T>,
    {
        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;

        let mut envelopes = match self.store.get(&collection.cache_key()).await {
            Ok(Some(bytes)) => decode(collection, &bytes),
            Ok(None) => Vec::new(),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to read cache for {}: {}",
                    collection, e
                )))
            }
        };

        let result = f(&mut envelopes)?;
        self.save(collection, &envelopes).await?;
        Ok(result)
    }

    fn lock_for(&self, collection: Collection) -> Arc<Mutex<()>> {
        self.locks
            .get(&collection)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())))
    }
}

/// Decode a cache payload, accepting the legacy untagged layout.
fn decode(collection: Collection, bytes: &[u8]) -> Vec<Envelope> {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!("Discarding corrupt cache for {}: {}", collection, e);
            return Vec::new();
        }
    };

    let envelopes = match value {
        Value::Array(_) => value,
        Value::Object(mut payload) => {
            let version = payload.get("version").and_then(Value::as_u64);
            if version != Some(u64::from(CACHE_FORMAT_VERSION)) {
                warn!(
                    "Ignoring cache for {} with unsupported format version {:?}",
                    collection, version
                );
                return Vec::new();
            }
            payload.remove("envelopes").unwrap_or(Value::Array(Vec::new()))
        }
        _ => {
            warn!("Discarding cache for {}: unexpected payload shape", collection);
            return Vec::new();
        }
    };

    match serde_json::from_value(envelopes) {
        Ok(envelopes) => envelopes,
        Err(e) => {
            warn!("Discarding corrupt cache for {}: {}", collection, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SyncStatus;
    use chrono::{TimeZone, Utc};
    use ledgersync_common::{Category, RecordDraft};
    use ledgersync_storage::MemoryKv;

    fn envelope(id: &str) -> Envelope {
        let date = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        Envelope::new_pending(RecordDraft::new(10.0, date, Category::Groceries).into_record(id))
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let cache = LocalCache::new(Arc::new(MemoryKv::new()));
        cache
            .save(Collection::Expenses, &[envelope("b"), envelope("a")])
            .await
            .unwrap();

        let loaded = cache.load(Collection::Expenses).await;
        let ids: Vec<&str> = loaded.iter().map(Envelope::id).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(cache.load(Collection::Income).await.is_empty());
    }

    #[tokio::test]
    async fn test_payload_is_version_tagged() {
        let kv = Arc::new(MemoryKv::new());
        let cache = LocalCache::new(kv.clone());
        cache.save(Collection::Notes, &[envelope("a")]).await.unwrap();

        let raw = kv.get(&Collection::Notes.cache_key()).await.unwrap().unwrap();
        let value: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["version"], serde_json::json!(CACHE_FORMAT_VERSION));
        assert_eq!(value["envelopes"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_legacy_untagged_payload_loads() {
        let kv = Arc::new(MemoryKv::new());
        let legacy = serde_json::to_vec(&vec![envelope("old")]).unwrap();
        kv.put(&Collection::Income.cache_key(), legacy).await.unwrap();

        let cache = LocalCache::new(kv);
        let loaded = cache.load(Collection::Income).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_corrupt_or_future_payload_loads_empty() {
        let kv = Arc::new(MemoryKv::new());
        kv.put(&Collection::Income.cache_key(), b"{oops".to_vec())
            .await
            .unwrap();
        kv.put(
            &Collection::Expenses.cache_key(),
            br#"{"version": 99, "envelopes": []}"#.to_vec(),
        )
        .await
        .unwrap();

        let cache = LocalCache::new(kv);
        assert!(cache.load(Collection::Income).await.is_empty());
        assert!(cache.load(Collection::Expenses).await.is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_degrades_write_failure_propagates() {
        let kv = Arc::new(MemoryKv::new());
        let cache = LocalCache::new(kv.clone());
        cache.save(Collection::Income, &[envelope("a")]).await.unwrap();

        kv.set_fail_reads(true);
        assert!(cache.load(Collection::Income).await.is_empty());
        assert!(matches!(
            cache.mutate(Collection::Income, |_| Ok(())).await,
            Err(Error::Storage(_))
        ));

        kv.set_fail_reads(false);
        kv.set_fail_writes(true);
        assert!(matches!(
            cache.save(Collection::Income, &[]).await,
            Err(Error::Storage(_))
        ));
        assert_eq!(cache.load(Collection::Income).await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_do_not_lose_updates() {
        let cache = Arc::new(LocalCache::new(Arc::new(MemoryKv::new())));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .mutate(Collection::Expenses, |list| {
                        list.insert(0, envelope(&i.to_string()));
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(cache.load(Collection::Expenses).await.len(), 20);
    }

    #[tokio::test]
    async fn test_failed_mutation_is_not_saved() {
        let cache = LocalCache::new(Arc::new(MemoryKv::new()));
        cache.save(Collection::Income, &[envelope("a")]).await.unwrap();

        let result: Result<()> = cache
            .mutate(Collection::Income, |list| {
                list.clear();
                Err(Error::NotFound("nope".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(cache.load(Collection::Income).await.len(), 1);
    }
}
