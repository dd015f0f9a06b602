//! Domain types shared by the cache, the remote adapters and the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of collections the engine knows about.
///
/// Each collection maps 1:1 onto a remote collection and a local cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Collection {
    Income,
    Expenses,
    HouseholdExpenses,
    Notes,
    SupplierInvoices,
    Savings,
}

impl Collection {
    /// Every registered collection, in registry order.
    pub const ALL: [Collection; 6] = [
        Collection::Income,
        Collection::Expenses,
        Collection::HouseholdExpenses,
        Collection::Notes,
        Collection::SupplierInvoices,
        Collection::Savings,
    ];

    /// Name of the remote collection.
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Income => "income",
            Collection::Expenses => "expenses",
            Collection::HouseholdExpenses => "household-expenses",
            Collection::Notes => "notes",
            Collection::SupplierInvoices => "supplier-invoices",
            Collection::Savings => "savings",
        }
    }

    /// Key under which the local cache stores this collection.
    pub fn cache_key(&self) -> String {
        format!("ledgersync.cache.{}", self.name())
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Collection::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown collection: {}", s)))
    }
}

/// Category of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Salary,
    Freelance,
    Investment,
    Rent,
    Utilities,
    Groceries,
    Transport,
    Supplies,
    Maintenance,
    Other,
}

impl Category {
    const ALL: [Category; 10] = [
        Category::Salary,
        Category::Freelance,
        Category::Investment,
        Category::Rent,
        Category::Utilities,
        Category::Groceries,
        Category::Transport,
        Category::Supplies,
        Category::Maintenance,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Salary => "Salary",
            Category::Freelance => "Freelance",
            Category::Investment => "Investment",
            Category::Rent => "Rent",
            Category::Utilities => "Utilities",
            Category::Groceries => "Groceries",
            Category::Transport => "Transport",
            Category::Supplies => "Supplies",
            Category::Maintenance => "Maintenance",
            Category::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown category: {}", s)))
    }
}

/// Data submitted by a caller for a new or edited record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDraft {
    pub amount: f64,
    pub date: DateTime<Utc>,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RecordDraft {
    /// Create a draft with only the required fields set.
    pub fn new(amount: f64, date: DateTime<Utc>, category: Category) -> Self {
        Self {
            amount,
            date,
            category,
            description: None,
            supplier: None,
            notes: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_supplier(mut self, supplier: impl Into<String>) -> Self {
        self.supplier = Some(supplier.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Check the draft against the rules of the target collection.
    ///
    /// # Errors
    /// - Amount is negative or not finite
    /// - A field required by the collection is missing or blank
    pub fn validate(&self, collection: Collection) -> crate::Result<()> {
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(crate::Error::InvalidInput(format!(
                "Amount must be a non-negative number, got {}",
                self.amount
            )));
        }

        let required = match collection {
            Collection::Notes => Some(("description", &self.description)),
            Collection::SupplierInvoices => Some(("supplier", &self.supplier)),
            _ => None,
        };

        if let Some((field, value)) = required {
            if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                return Err(crate::Error::InvalidInput(format!(
                    "Field '{}' is required for {}",
                    field, collection
                )));
            }
        }

        Ok(())
    }

    /// Turn the draft into a record with the given local id.
    pub fn into_record(self, id: impl Into<String>) -> Record {
        Record {
            id: id.into(),
            amount: self.amount,
            date: self.date,
            category: self.category,
            description: self.description,
            supplier: self.supplier,
            notes: self.notes,
            remote_id: None,
        }
    }
}

/// A business entity as callers see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub amount: f64,
    pub date: DateTime<Utc>,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Identifier assigned by the remote store once the record has been created there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl Record {
    /// Domain fields only, as sent to the remote store.
    ///
    /// The local id and the remote id are never part of the remote payload.
    pub fn to_fields(&self) -> crate::Result<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(mut fields) => {
                fields.remove("id");
                fields.remove("remoteId");
                Ok(fields)
            }
            other => Err(crate::Error::Serialization(format!(
                "Record serialized to a non-object value: {}",
                other
            ))),
        }
    }

    /// Domain fields for a merging update.
    ///
    /// Unlike [`to_fields`](Self::to_fields), unset optional fields are sent
    /// as `null` so the remote copy drops values cleared locally.
    pub fn to_update_fields(&self) -> crate::Result<serde_json::Map<String, serde_json::Value>> {
        let mut fields = self.to_fields()?;
        for key in Self::OPTIONAL_FIELDS {
            fields
                .entry(key.to_string())
                .or_insert(serde_json::Value::Null);
        }
        Ok(fields)
    }

    const OPTIONAL_FIELDS: [&'static str; 3] = ["description", "supplier", "notes"];

    /// Replace the domain fields with those of `draft`, keeping both ids.
    pub fn apply(&mut self, draft: RecordDraft) {
        self.amount = draft.amount;
        self.date = draft.date;
        self.category = draft.category;
        self.description = draft.description;
        self.supplier = draft.supplier;
        self.notes = draft.notes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn jan_15() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(Collection::HouseholdExpenses.name(), "household-expenses");
        assert_eq!(
            Collection::Income.cache_key(),
            "ledgersync.cache.income"
        );
        assert_eq!(
            "supplier-invoices".parse::<Collection>().unwrap(),
            Collection::SupplierInvoices
        );
        assert!("unknown".parse::<Collection>().is_err());
    }

    #[test]
    fn test_category_parse_is_case_insensitive() {
        assert_eq!("other".parse::<Category>().unwrap(), Category::Other);
        assert_eq!("Rent".parse::<Category>().unwrap(), Category::Rent);
        assert!("lottery".parse::<Category>().is_err());
    }

    #[test]
    fn test_negative_amount_rejected() {
        let draft = RecordDraft::new(-1.0, jan_15(), Category::Other);
        assert!(draft.validate(Collection::Income).is_err());

        let draft = RecordDraft::new(f64::NAN, jan_15(), Category::Other);
        assert!(draft.validate(Collection::Income).is_err());
    }

    #[test]
    fn test_required_fields_per_collection() {
        let draft = RecordDraft::new(0.0, jan_15(), Category::Other);
        assert!(draft.validate(Collection::Notes).is_err());
        assert!(draft
            .clone()
            .with_description("   ")
            .validate(Collection::Notes)
            .is_err());
        assert!(draft
            .clone()
            .with_description("call the plumber")
            .validate(Collection::Notes)
            .is_ok());

        assert!(draft.validate(Collection::SupplierInvoices).is_err());
        assert!(draft
            .with_supplier("ACME")
            .validate(Collection::SupplierInvoices)
            .is_ok());
    }

    #[test]
    fn test_record_fields_exclude_ids() {
        let mut record = RecordDraft::new(500.0, jan_15(), Category::Other).into_record("local-1");
        record.remote_id = Some("remote-1".to_string());

        let fields = record.to_fields().unwrap();
        assert!(!fields.contains_key("id"));
        assert!(!fields.contains_key("remoteId"));
        assert_eq!(fields["amount"], serde_json::json!(500.0));
        assert_eq!(fields["category"], serde_json::json!("Other"));
        assert!(!fields.contains_key("notes"));
    }

    #[test]
    fn test_update_fields_null_out_cleared_values() {
        let record = RecordDraft::new(1.0, jan_15(), Category::Rent)
            .with_supplier("Landlord")
            .into_record("local-1");

        let fields = record.to_update_fields().unwrap();
        assert_eq!(fields["supplier"], serde_json::json!("Landlord"));
        assert_eq!(fields["notes"], serde_json::Value::Null);
        assert_eq!(fields["description"], serde_json::Value::Null);
        assert!(!fields.contains_key("remoteId"));

        // Null reads back as unset
        let mut value = serde_json::Value::Object(fields);
        value["id"] = serde_json::json!("local-1");
        let restored: Record = serde_json::from_value(value).unwrap();
        assert_eq!(restored.notes, None);
        assert_eq!(restored, record);
    }

    proptest! {
        #[test]
        fn prop_finite_non_negative_amounts_are_valid(amount in 0.0f64..1.0e12) {
            let draft = RecordDraft::new(amount, jan_15(), Category::Salary);
            prop_assert!(draft.validate(Collection::Income).is_ok());
        }
    }
}
