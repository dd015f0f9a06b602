//! Live query subscriptions over the remote store.
//!
//! A subscription publishes `{data, loading, error}` through a
//! `tokio::sync::watch` channel. Every remote notification carries the full
//! result set, so `data` is always replaced wholesale.

use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ledgersync_common::{Error, Result};
use ledgersync_storage::{Document, Query, RemoteStore};

/// Maps a remote document to the value handed to subscribers.
pub type Transform<T> = Arc<dyn Fn(&Document) -> Result<T> + Send + Sync>;

/// What to subscribe to.
pub struct SubscriptionSpec<T> {
    pub query: Query,
    transform: Transform<T>,
}

impl<T: DeserializeOwned + 'static> SubscriptionSpec<T> {
    /// Deserialize each document's fields, plus its id, into `T`.
    pub fn new(query: Query) -> Self {
        Self {
            query,
            transform: Arc::new(|doc: &Document| Ok(serde_json::from_value(doc.materialize())?)),
        }
    }
}

impl<T> SubscriptionSpec<T> {
    /// Use a custom mapping from documents to values.
    pub fn with_transform<F>(query: Query, transform: F) -> Self
    where
        F: Fn(&Document) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            query,
            transform: Arc::new(transform),
        }
    }
}

/// Current state of a subscription.
#[derive(Debug)]
pub struct SubscriptionState<T> {
    /// Latest complete result set.
    pub data: Arc<Vec<T>>,
    /// True until the first snapshot of the current query arrives.
    pub loading: bool,
    /// Last failure, cleared by the next good snapshot.
    pub error: Option<Arc<Error>>,
}

impl<T> Clone for SubscriptionState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            loading: self.loading,
            error: self.error.clone(),
        }
    }
}

impl<T> Default for SubscriptionState<T> {
    fn default() -> Self {
        Self {
            data: Arc::new(Vec::new()),
            loading: true,
            error: None,
        }
    }
}

/// Opens subscriptions against one remote store.
#[derive(Clone)]
pub struct SubscriptionChannel {
    remote: Arc<dyn RemoteStore>,
}

impl SubscriptionChannel {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self { remote }
    }

    /// Open a subscription. Must be called from within a tokio runtime.
    pub fn open<T: Send + Sync + 'static>(
        remote: Arc<dyn RemoteStore>,
        spec: SubscriptionSpec<T>,
    ) -> Subscription<T> {
        let (state_tx, state_rx) = watch::channel(SubscriptionState::default());
        let mut subscription = Subscription {
            remote,
            query: spec.query,
            transform: spec.transform,
            state_tx: Arc::new(state_tx),
            state_rx,
            generation: Arc::new(AtomicU64::new(0)),
            task: None,
        };
        subscription.start();
        subscription
    }

    pub fn subscribe<T: Send + Sync + 'static>(&self, spec: SubscriptionSpec<T>) -> Subscription<T> {
        Self::open(self.remote.clone(), spec)
    }
}

/// A live query.
///
/// The underlying remote subscription is released when the query changes,
/// on [`unsubscribe`](Self::unsubscribe), and on drop.
pub struct Subscription<T> {
    remote: Arc<dyn RemoteStore>,
    query: Query,
    transform: Transform<T>,
    state_tx: Arc<watch::Sender<SubscriptionState<T>>>,
    state_rx: watch::Receiver<SubscriptionState<T>>,
    /// Bumped on every (re)subscribe; snapshots from older runs are dropped.
    generation: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + Sync + 'static> Subscription<T> {
    pub fn data(&self) -> Arc<Vec<T>> {
        self.state_rx.borrow().data.clone()
    }

    pub fn loading(&self) -> bool {
        self.state_rx.borrow().loading
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.state_rx.borrow().error.clone()
    }

    /// The whole state at once.
    pub fn snapshot(&self) -> SubscriptionState<T> {
        self.state_rx.borrow().clone()
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) -> Result<()> {
        self.state_rx
            .changed()
            .await
            .map_err(|_| Error::Subscription("Subscription closed".to_string()))
    }

    /// Wait until the state satisfies `predicate`, and return it.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<SubscriptionState<T>>
    where
        F: FnMut(&SubscriptionState<T>) -> bool,
    {
        self.state_rx
            .wait_for(|state| predicate(state))
            .await
            .map(|state| state.clone())
            .map_err(|_| Error::Subscription("Subscription closed".to_string()))
    }

    /// Another receiver on the same state, for fan-out.
    pub fn watcher(&self) -> watch::Receiver<SubscriptionState<T>> {
        self.state_rx.clone()
    }

    /// Switch to a different query.
    ///
    /// Returns `false`, keeping the current remote subscription, when the
    /// new query is structurally equal to the current one.
    pub fn set_query(&mut self, query: Query) -> bool {
        if query == self.query {
            return false;
        }
        debug!("Resubscribing to {}", query.collection);
        self.query = query;
        self.start();
        true
    }

    /// Release the remote subscription. No further updates are published.
    pub fn unsubscribe(&mut self) {
        self.stop();
        self.state_tx.send_modify(|state| state.loading = false);
    }

    fn start(&mut self) {
        self.stop();

        // Bumped under the state lock so a stale run cannot publish afterwards
        let mut generation = 0;
        self.state_tx.send_modify(|state| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            state.loading = true;
            state.error = None;
        });

        let run = SnapshotRun {
            remote: self.remote.clone(),
            query: self.query.clone(),
            transform: self.transform.clone(),
            state_tx: self.state_tx.clone(),
            generation: self.generation.clone(),
            current: generation,
        };
        self.task = Some(tokio::spawn(run.run()));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // Invalidate the aborted run in case it is mid-publish
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct SnapshotRun<T> {
    remote: Arc<dyn RemoteStore>,
    query: Query,
    transform: Transform<T>,
    state_tx: Arc<watch::Sender<SubscriptionState<T>>>,
    generation: Arc<AtomicU64>,
    current: u64,
}

impl<T: Send + Sync + 'static> SnapshotRun<T> {
    async fn run(self) {
        let mut stream = match self.remote.watch(self.query.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open live query on {}: {}", self.query.collection, e);
                self.publish(Err(e));
                return;
            }
        };

        while let Some(item) = stream.next().await {
            let result = item.and_then(|documents| transform_all(&self.transform, &documents));
            if let Err(e) = &result {
                warn!("Live query on {} failed: {}", self.query.collection, e);
            }
            if !self.publish(result) {
                break;
            }
        }

        debug!("Live query on {} ended", self.query.collection);
    }

    /// Publish a result unless this run has been superseded.
    fn publish(&self, result: Result<Vec<T>>) -> bool {
        let mut current = true;
        self.state_tx.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != self.current {
                current = false;
                return false;
            }
            state.loading = false;
            match result {
                Ok(data) => {
                    state.data = Arc::new(data);
                    state.error = None;
                }
                Err(e) => state.error = Some(Arc::new(e)),
            }
            true
        });
        current
    }
}

/// Apply the transform to every document. Panics become errors.
fn transform_all<T>(transform: &Transform<T>, documents: &[Document]) -> Result<Vec<T>> {
    documents
        .iter()
        .map(|doc| match catch_unwind(AssertUnwindSafe(|| transform(doc))) {
            Ok(result) => result,
            Err(payload) => Err(Error::Subscription(format!(
                "Transform panicked on document {}: {}",
                doc.id,
                panic_message(payload.as_ref())
            ))),
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
