//! Filesystem-backed remote store.

use async_trait::async_trait;
use futures::stream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use ledgersync_common::{Collection, Error, Result};

use crate::provider::{Document, Fields, RemoteStore, SnapshotStream};
use crate::query::Query;

/// Remote store kept in a local directory.
///
/// Stores one directory per collection and one JSON file per document.
/// Handy for a shared folder acting as the "remote" or for running the
/// CLI without a server. Live queries only observe changes made through
/// this instance.
#[derive(Clone)]
pub struct FsRemote {
    root: PathBuf,
    revision: Arc<watch::Sender<u64>>,
}

impl FsRemote {
    /// Create a new filesystem store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Invalid path
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        let (revision, _) = watch::channel(0);
        Ok(Self {
            root,
            revision: Arc::new(revision),
        })
    }

    fn collection_dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.name())
    }

    fn document_path(&self, collection: Collection, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(Error::InvalidInput(format!("Invalid document id: {}", id)));
        }
        Ok(self.collection_dir(collection).join(format!("{}.json", id)))
    }

    async fn read_document(&self, path: &Path) -> Result<Document> {
        let content = fs::read(path).await?;
        Ok(serde_json::from_slice(&content)?)
    }

    async fn write_document(&self, collection: Collection, document: &Document) -> Result<()> {
        fs::create_dir_all(self.collection_dir(collection)).await?;

        let path = self.document_path(collection, &document.id)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(document)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

#[async_trait]
impl RemoteStore for FsRemote {
    fn name(&self) -> &str {
        "fs"
    }

    async fn create(&self, collection: Collection, fields: Fields) -> Result<String> {
        let document = Document::new(Uuid::new_v4().to_string(), fields);
        self.write_document(collection, &document).await?;
        self.bump();
        Ok(document.id)
    }

    async fn update(&self, collection: Collection, id: &str, partial: Fields) -> Result<()> {
        let path = self.document_path(collection, id)?;
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "Document not found: {}/{}",
                collection, id
            )));
        }

        let mut document = self.read_document(&path).await?;
        document.merge(partial);
        self.write_document(collection, &document).await?;
        self.bump();
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let path = self.document_path(collection, id)?;
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "Document not found: {}/{}",
                collection, id
            )));
        }

        fs::remove_file(&path).await?;
        self.bump();
        Ok(())
    }

    async fn list_all(&self, collection: Collection) -> Result<Vec<Document>> {
        let dir = self.collection_dir(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match self.read_document(&path).await {
                Ok(document) => results.push(document),
                Err(e) => warn!("Skipping unreadable document {}: {}", path.display(), e),
            }
        }

        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }

    async fn watch(&self, query: Query) -> Result<SnapshotStream> {
        let rx = self.revision.subscribe();
        let store = self.clone();

        let stream = stream::unfold(
            (store, rx, query, true),
            |(store, mut rx, query, first)| async move {
                if !first && rx.changed().await.is_err() {
                    return None;
                }
                let snapshot = store
                    .list_all(query.collection)
                    .await
                    .map(|docs| query.apply(docs));
                Some((snapshot, (store, rx, query, false)))
            },
        );

        Ok(Box::pin(stream))
    }
}
