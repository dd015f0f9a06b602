//! Live query description and in-process evaluation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use ledgersync_common::Collection;

use crate::provider::Document;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// Ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Equality filter on a top-level field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

/// A query against one remote collection.
///
/// Queries compare structurally; two queries built from the same parts are
/// equal, which is what subscribers use to decide whether to re-subscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: Collection,
    pub order_by: Option<OrderBy>,
    pub filters: Vec<Filter>,
}

impl Query {
    /// Match every document in `collection`, unordered.
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            order_by: None,
            filters: Vec::new(),
        }
    }

    /// Set the ordering clause.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Add an equality filter.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Whether a document passes every filter.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|filter| {
            field_value(doc, &filter.field).is_some_and(|v| values_equal(&v, &filter.value))
        })
    }

    /// Filter and order a set of documents from this query's collection.
    pub fn apply(&self, documents: Vec<Document>) -> Vec<Document> {
        let mut results: Vec<Document> =
            documents.into_iter().filter(|doc| self.matches(doc)).collect();

        if let Some(order) = &self.order_by {
            results.sort_by(|a, b| {
                let left = field_value(a, &order.field);
                let right = field_value(b, &order.field);
                match (left, right) {
                    (Some(l), Some(r)) => {
                        let ord = compare_values(&l, &r);
                        match order.direction {
                            Direction::Asc => ord,
                            Direction::Desc => ord.reverse(),
                        }
                    }
                    // Documents missing the field go last in either direction
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            });
        }

        results
    }
}

/// Resolve a field name against a document, including the server fields.
fn field_value(doc: &Document, field: &str) -> Option<Value> {
    match field {
        "id" => Some(Value::String(doc.id.clone())),
        "createdAt" => Some(Value::String(doc.created_at.to_rfc3339())),
        "updatedAt" => Some(Value::String(doc.updated_at.to_rfc3339())),
        _ => doc.fields.get(field).cloned(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}
