//! In-memory remote store for testing.

use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use ledgersync_common::{Collection, Error, Result};

use crate::provider::{Document, Fields, RemoteStore, SnapshotStream};
use crate::query::Query;

#[derive(Debug, Default)]
struct Inner {
    /// Documents per collection, in creation order.
    collections: HashMap<Collection, Vec<Document>>,
    /// Every call fails while set.
    offline: bool,
    /// Number of upcoming calls that fail before the store answers again.
    fail_next: u32,
    /// Create calls received, failed ones included.
    create_attempts: u64,
}

impl Inner {
    fn check_available(&mut self) -> Result<()> {
        if self.offline {
            return Err(Error::Network("Remote store unreachable".to_string()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(Error::Network("Injected remote failure".to_string()));
        }
        Ok(())
    }

    fn documents_mut(&mut self, collection: Collection) -> &mut Vec<Document> {
        self.collections.entry(collection).or_default()
    }
}

/// In-memory remote store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Failures can be injected with [`set_offline`] and
/// [`fail_next`] to exercise the offline paths of the coordinator.
///
/// [`set_offline`]: MemoryRemote::set_offline
/// [`fail_next`]: MemoryRemote::fail_next
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<RwLock<Inner>>,
    /// Revision counter bumped on every mutation; drives live queries.
    revision: Arc<watch::Sender<u64>>,
}

impl MemoryRemote {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            revision: Arc::new(revision),
        }
    }

    /// Make every subsequent call fail (or succeed again).
    pub async fn set_offline(&self, offline: bool) {
        self.inner.write().await.offline = offline;
    }

    /// Fail the next `count` calls, whatever they are.
    pub async fn fail_next(&self, count: u32) {
        self.inner.write().await.fail_next = count;
    }

    /// Number of create calls received so far, failed ones included.
    pub async fn create_attempts(&self) -> u64 {
        self.inner.read().await.create_attempts
    }

    /// Number of documents currently held in a collection.
    pub async fn count(&self, collection: Collection) -> usize {
        self.inner
            .read()
            .await
            .collections
            .get(&collection)
            .map_or(0, Vec::len)
    }

    /// Insert a document as-is, bypassing fault injection.
    ///
    /// Used to seed the store with documents created "elsewhere".
    pub async fn seed(&self, collection: Collection, document: Document) {
        self.inner
            .write()
            .await
            .documents_mut(collection)
            .push(document);
        self.bump();
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    async fn snapshot(&self, query: &Query) -> Vec<Document> {
        let documents = self
            .inner
            .read()
            .await
            .collections
            .get(&query.collection)
            .cloned()
            .unwrap_or_default();
        query.apply(documents)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, collection: Collection, fields: Fields) -> Result<String> {
        let id = {
            let mut inner = self.inner.write().await;
            inner.create_attempts += 1;
            inner.check_available()?;

            let id = Uuid::new_v4().to_string();
            inner
                .documents_mut(collection)
                .push(Document::new(id.clone(), fields));
            id
        };

        self.bump();
        Ok(id)
    }

    async fn update(&self, collection: Collection, id: &str, partial: Fields) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.check_available()?;

            let doc = inner
                .documents_mut(collection)
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| Error::NotFound(format!("Document not found: {}/{}", collection, id)))?;
            doc.merge(partial);
        }

        self.bump();
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.check_available()?;

            let documents = inner.documents_mut(collection);
            let before = documents.len();
            documents.retain(|d| d.id != id);
            if documents.len() == before {
                return Err(Error::NotFound(format!(
                    "Document not found: {}/{}",
                    collection, id
                )));
            }
        }

        self.bump();
        Ok(())
    }

    async fn list_all(&self, collection: Collection) -> Result<Vec<Document>> {
        let mut inner = self.inner.write().await;
        inner.check_available()?;
        Ok(inner.documents_mut(collection).clone())
    }

    async fn watch(&self, query: Query) -> Result<SnapshotStream> {
        self.inner.write().await.check_available()?;

        let rx = self.revision.subscribe();
        let store = self.clone();

        let stream = stream::unfold(
            (store, rx, query, true),
            |(store, mut rx, query, first)| async move {
                if !first && rx.changed().await.is_err() {
                    return None;
                }
                let _ = rx.borrow_and_update();
                let snapshot = store.snapshot(&query).await;
                Some((Ok(snapshot), (store, rx, query, false)))
            },
        );

        Ok(Box::pin(stream))
    }
}
