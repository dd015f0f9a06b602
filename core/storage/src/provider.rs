//! Remote store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use ledgersync_common::{Collection, Result};

use crate::query::Query;

/// Document body: the domain fields of a record, as a JSON object.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// A document held by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Server-assigned identifier. Never changes once assigned.
    pub id: String,
    /// Domain fields.
    pub fields: Fields,
    /// Stamped by the server on create.
    pub created_at: DateTime<Utc>,
    /// Stamped by the server on every create and update.
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a freshly stamped document.
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            fields,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge `partial` into the fields and restamp `updated_at`.
    pub fn merge(&mut self, partial: Fields) {
        for (key, value) in partial {
            self.fields.insert(key, value);
        }
        self.updated_at = Utc::now();
    }

    /// The fields as a JSON object with the document id folded in as `id`.
    pub fn materialize(&self) -> serde_json::Value {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), serde_json::Value::String(self.id.clone()));
        serde_json::Value::Object(fields)
    }

    /// The record date, if the document carries a parseable `date` field.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.fields
            .get("date")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    /// Whether the document date lies within `[from, to]`.
    pub fn in_date_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.date().is_some_and(|d| d >= from && d <= to)
    }
}

/// Live query result stream. Every item is the complete current result set.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<Vec<Document>>> + Send>>;

/// Remote durable document store.
///
/// Every call may fail transiently. Implementations never retry on their own;
/// retry policy belongs to the caller.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "fs", "http").
    fn name(&self) -> &str;

    /// Create a document and return its server-assigned id.
    ///
    /// # Postconditions
    /// - `created_at` and `updated_at` are stamped by the store
    ///
    /// # Errors
    /// - Network/I/O errors
    /// - Authentication errors
    async fn create(&self, collection: Collection, fields: Fields) -> Result<String>;

    /// Merge `partial` into an existing document.
    ///
    /// # Postconditions
    /// - `updated_at` is restamped
    ///
    /// # Errors
    /// - Document not found
    /// - Network/I/O errors
    async fn update(&self, collection: Collection, id: &str, partial: Fields) -> Result<()>;

    /// Delete a document.
    ///
    /// # Errors
    /// - Document not found
    /// - Network/I/O errors
    async fn delete(&self, collection: Collection, id: &str) -> Result<()>;

    /// List every document in a collection.
    async fn list_all(&self, collection: Collection) -> Result<Vec<Document>>;

    /// List documents whose `date` lies within `[from, to]`.
    async fn list_by_date_range(
        &self,
        collection: Collection,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Document>> {
        let documents = self.list_all(collection).await?;
        Ok(documents
            .into_iter()
            .filter(|doc| doc.in_date_range(from, to))
            .collect())
    }

    /// Open a live query.
    ///
    /// The stream yields the full result set once on open and again after
    /// every change that may affect it. Dropping the stream releases the
    /// underlying subscription.
    async fn watch(&self, query: Query) -> Result<SnapshotStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_document_date_range() {
        let doc = Document::new("doc-1", fields(json!({"date": "2024-01-15T00:00:00Z"})));

        let jan_1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let jan_15 = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let feb_1 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        assert!(doc.in_date_range(jan_1, feb_1));
        assert!(doc.in_date_range(jan_15, jan_15));
        assert!(!doc.in_date_range(feb_1, feb_1));

        let undated = Document::new("doc-2", Fields::new());
        assert!(!undated.in_date_range(jan_1, feb_1));
    }

    #[test]
    fn test_merge_restamps_updated_at() {
        let mut doc = Document::new("doc-1", fields(json!({"amount": 1, "category": "Rent"})));
        let created = doc.created_at;

        doc.merge(fields(json!({"amount": 2})));

        assert_eq!(doc.fields["amount"], json!(2));
        assert_eq!(doc.fields["category"], json!("Rent"));
        assert_eq!(doc.created_at, created);
        assert!(doc.updated_at >= created);
    }
}
