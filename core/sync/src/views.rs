//! Aggregates over cached records.

use chrono::Datelike;
use std::collections::BTreeMap;

use ledgersync_common::Record;

/// Bucket for records that name no supplier.
pub const UNASSIGNED_SUPPLIER: &str = "Unassigned";

/// Sum of all amounts.
pub fn total(records: &[Record]) -> f64 {
    records.iter().map(|r| r.amount).sum()
}

/// Sums per `(year, month)` of the record date.
pub fn monthly_totals(records: &[Record]) -> BTreeMap<(i32, u32), f64> {
    let mut totals = BTreeMap::new();
    for record in records {
        *totals
            .entry((record.date.year(), record.date.month()))
            .or_insert(0.0) += record.amount;
    }
    totals
}

/// Sums per supplier. Blank suppliers count as unassigned.
pub fn totals_by_supplier(records: &[Record]) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for record in records {
        let supplier = record
            .supplier
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNASSIGNED_SUPPLIER);
        *totals.entry(supplier.to_string()).or_insert(0.0) += record.amount;
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ledgersync_common::{Category, RecordDraft};

    fn record(amount: f64, month: u32, supplier: Option<&str>) -> Record {
        let date = Utc.with_ymd_and_hms(2024, month, 10, 0, 0, 0).unwrap();
        let mut draft = RecordDraft::new(amount, date, Category::Supplies);
        if let Some(supplier) = supplier {
            draft = draft.with_supplier(supplier);
        }
        draft.into_record(format!("{}-{}", month, amount))
    }

    #[test]
    fn test_totals() {
        let records = vec![
            record(10.0, 1, Some("ACME")),
            record(5.0, 1, None),
            record(2.5, 3, Some("ACME")),
            record(1.0, 3, Some("  ")),
        ];

        assert_eq!(total(&records), 18.5);

        let monthly = monthly_totals(&records);
        assert_eq!(monthly.get(&(2024, 1)), Some(&15.0));
        assert_eq!(monthly.get(&(2024, 3)), Some(&3.5));
        assert_eq!(monthly.len(), 2);

        let by_supplier = totals_by_supplier(&records);
        assert_eq!(by_supplier.get("ACME"), Some(&12.5));
        assert_eq!(by_supplier.get(UNASSIGNED_SUPPLIER), Some(&6.0));
    }

    #[test]
    fn test_empty() {
        assert_eq!(total(&[]), 0.0);
        assert!(monthly_totals(&[]).is_empty());
        assert!(totals_by_supplier(&[]).is_empty());
    }
}
