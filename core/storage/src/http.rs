//! JSON-over-HTTP remote store.
//!
//! Talks to a document API laid out as one resource per collection:
//!
//! - `POST   {base}/{collection}`           body: fields, response: `{"id": ...}`
//! - `PATCH  {base}/{collection}/{id}`      body: partial fields
//! - `DELETE {base}/{collection}/{id}`
//! - `GET    {base}/{collection}[?from=&to=]` response: array of documents
//!
//! The server stamps `createdAt` / `updatedAt`. Live queries poll the
//! collection and emit only when the result set changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use ledgersync_common::{Collection, Error, Result};

use crate::provider::{Document, Fields, RemoteStore, SnapshotStream};
use crate::query::Query;

/// Default interval between polls of a live query.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Response from a create call.
#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

/// Remote store reached over HTTP.
#[derive(Clone)]
pub struct RestRemote {
    http: Client,
    base: Url,
    token: Option<String>,
    poll_interval: Duration,
}

impl RestRemote {
    /// Create a client for the API rooted at `base_url`.
    ///
    /// # Errors
    /// - Base URL cannot be parsed
    /// - HTTP client cannot be built
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        // A trailing slash makes `Url::join` append rather than replace
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base = Url::parse(&normalized)
            .map_err(|e| Error::InvalidInput(format!("Invalid remote URL {}: {}", base_url, e)))?;

        let http = Client::builder()
            .user_agent("Ledgersync/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            token,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Set the live-query poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn collection_url(&self, collection: Collection) -> Result<Url> {
        self.base
            .join(collection.name())
            .map_err(|e| Error::InvalidInput(format!("Invalid collection URL: {}", e)))
    }

    fn document_url(&self, collection: Collection, id: &str) -> Result<Url> {
        let encoded = utf8_percent_encode(id, NON_ALPHANUMERIC).to_string();
        self.base
            .join(&format!("{}/{}", collection.name(), encoded))
            .map_err(|e| Error::InvalidInput(format!("Invalid document URL: {}", e)))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => builder,
        }
    }

    async fn fetch(
        &self,
        collection: Collection,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<Document>> {
        let mut builder = self.request(reqwest::Method::GET, self.collection_url(collection)?);
        if let Some((from, to)) = range {
            builder = builder.query(&[("from", from.to_rfc3339()), ("to", to.to_rfc3339())]);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to list {}: {}", collection, e)))?;

        let documents: Vec<Document> = Self::handle_response(response).await?;
        // The server may ignore the range parameters; filter again locally
        Ok(match range {
            Some((from, to)) => documents
                .into_iter()
                .filter(|doc| doc.in_date_range(from, to))
                .collect(),
            None => documents,
        })
    }

    /// Map an HTTP response onto the common error taxonomy.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => Error::NotFound("Resource not found".to_string()),
            StatusCode::UNAUTHORIZED => {
                Error::Authentication("Remote store rejected credentials".to_string())
            }
            StatusCode::FORBIDDEN => Error::PermissionDenied("Access denied".to_string()),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                Error::Network(format!("API error: {} - {}", status, body))
            }
            s if s.is_server_error() => Error::Network(format!("API error: {} - {}", status, body)),
            _ => Error::Remote(format!("API error: {} - {}", status, body)),
        })
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
    }
}

struct PollState {
    remote: RestRemote,
    query: Query,
    last: Option<Vec<Document>>,
    started: bool,
}

#[async_trait]
impl RemoteStore for RestRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn create(&self, collection: Collection, fields: Fields) -> Result<String> {
        let response = self
            .request(reqwest::Method::POST, self.collection_url(collection)?)
            .json(&fields)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to create document: {}", e)))?;

        let created: CreatedResponse = Self::handle_response(response).await?;
        Ok(created.id)
    }

    async fn update(&self, collection: Collection, id: &str, partial: Fields) -> Result<()> {
        let response = self
            .request(reqwest::Method::PATCH, self.document_url(collection, id)?)
            .json(&partial)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to update document: {}", e)))?;

        Self::check_status(response).await?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, self.document_url(collection, id)?)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to delete document: {}", e)))?;

        Self::check_status(response).await?;
        Ok(())
    }

    async fn list_all(&self, collection: Collection) -> Result<Vec<Document>> {
        self.fetch(collection, None).await
    }

    async fn list_by_date_range(
        &self,
        collection: Collection,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Document>> {
        self.fetch(collection, Some((from, to))).await
    }

    async fn watch(&self, query: Query) -> Result<SnapshotStream> {
        let state = PollState {
            remote: self.clone(),
            query,
            last: None,
            started: false,
        };

        let stream = stream::unfold(state, |mut state| async move {
            loop {
                if state.started {
                    tokio::time::sleep(state.remote.poll_interval).await;
                }
                state.started = true;

                match state.remote.fetch(state.query.collection, None).await {
                    Ok(documents) => {
                        let snapshot = state.query.apply(documents);
                        if state.last.as_ref() != Some(&snapshot) {
                            state.last = Some(snapshot.clone());
                            return Some((Ok(snapshot), state));
                        }
                        debug!("No change in {} since last poll", state.query.collection);
                    }
                    Err(e) => return Some((Err(e), state)),
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
