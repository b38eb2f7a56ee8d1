//! Table transports: an in-memory fake, a directory of JSON files, and a
//! PostgREST client.

use serde_json::Value;
use tablevault_core::{canonical_json, Row, UpsertOutcome};

pub mod directory;
pub mod memory;
pub mod rest;

pub use directory::DirectoryTransport;
pub use memory::{FaultOp, MemoryTransport};
pub use rest::RestTransport;

/// Merge `incoming` into `existing` by key, updating matched rows in place.
///
/// Rows without a key value are counted as errors.
pub(crate) fn merge_rows(
    existing: &mut Vec<Row>,
    key_column: &str,
    incoming: &[Row],
    exclude_columns: &[String],
) -> UpsertOutcome {
    let mut outcome = UpsertOutcome::default();
    for row in incoming {
        let Some(key) = row.get(key_column).filter(|value| !value.is_null()) else {
            outcome.errors += 1;
            outcome.error_details.push(format!("row has no `{key_column}` value"));
            continue;
        };
        let key = canonical_json(key);
        let filtered = row
            .iter()
            .filter(|(column, _)| !exclude_columns.iter().any(|ex| ex == *column))
            .map(|(column, value)| (column.clone(), value.clone()));

        match existing.iter_mut().find(|current| current.get(key_column).map(canonical_json).as_ref() == Some(&key)) {
            Some(current) => {
                for (column, value) in filtered {
                    current.insert(column, value);
                }
                outcome.updated += 1;
            }
            None => {
                existing.push(filtered.collect());
                outcome.inserted += 1;
            }
        }
    }
    outcome
}

/// Remove rows whose key matches one of `keys`, returning how many went.
pub(crate) fn remove_keys(existing: &mut Vec<Row>, key_column: &str, keys: &[Value]) -> usize {
    let targets: Vec<String> = keys.iter().map(canonical_json).collect();
    let before = existing.len();
    existing.retain(|row| {
        row.get(key_column).map_or(true, |value| !targets.contains(&canonical_json(value)))
    });
    before - existing.len()
}

pub(crate) fn page_of(rows: &[Row], offset: u64, page_size: usize) -> tablevault_core::Page {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(rows.len());
    let end = start.saturating_add(page_size.max(1)).min(rows.len());
    let next = if end < rows.len() { Some(end as u64) } else { None };
    tablevault_core::Page { rows: rows[start..end].to_vec(), next }
}
