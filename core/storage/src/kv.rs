//! Key-value backends for the local cache.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

use ledgersync_common::{Error, Result};

/// Persistent byte store addressed by string keys.
///
/// The local cache keeps one entry per collection in it.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value stored under `key`.
    ///
    /// # Postconditions
    /// - A subsequent `get` returns exactly `value`, or the previous value
    ///   if this call failed
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory key-value store for tests.
///
/// Reads and writes can be made to fail to exercise the degraded paths
/// of the cache.
#[derive(Clone, Default)]
pub struct MemoryKv {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `get` fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every `put` and `remove` fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Storage("Injected read failure".to_string()));
        }
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("Injected write failure".to_string()));
        }
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("Injected write failure".to_string()));
        }
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Key-value store with one file per key under a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// crash mid-write leaves the previous value intact.
pub struct FileKv {
    root: PathBuf,
}

impl FileKv {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// # Errors
    /// - Directory cannot be created
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(Error::InvalidInput(format!("Invalid cache key: {}", key)));
        }
        Ok(self.root.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl KeyValueStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, &value)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", key, e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to commit {}: {}", key, e)))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to remove {}: {}", key, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_kv_roundtrip_and_faults() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("k").await.unwrap(), None);

        kv.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));

        kv.set_fail_writes(true);
        assert!(kv.put("k", b"w".to_vec()).await.is_err());
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));

        kv.set_fail_reads(true);
        assert!(kv.get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_file_kv_persists_across_instances() {
        let temp = TempDir::new().unwrap();

        FileKv::new(temp.path())
            .unwrap()
            .put("ledgersync.cache.income", b"[]".to_vec())
            .await
            .unwrap();

        let reopened = FileKv::new(temp.path()).unwrap();
        assert_eq!(
            reopened.get("ledgersync.cache.income").await.unwrap(),
            Some(b"[]".to_vec())
        );
        assert!(!temp.path().join("ledgersync.cache.income.json.tmp").exists());

        reopened.remove("ledgersync.cache.income").await.unwrap();
        reopened.remove("ledgersync.cache.income").await.unwrap();
        assert_eq!(reopened.get("ledgersync.cache.income").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_kv_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let kv = FileKv::new(temp.path()).unwrap();
        assert!(kv.get("../outside").await.is_err());
    }
}
