use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tablevault_core::{canonical_json, Page, Row, TableTransport, TransportError, UpsertOutcome};

use crate::{merge_rows, page_of, remove_keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Fetch,
    Upsert,
    Count,
    Delete,
}

#[derive(Debug, Clone)]
struct Fault {
    table: String,
    op: FaultOp,
    error: TransportError,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Row>>,
    faults: Vec<Fault>,
    poisoned: BTreeMap<String, Vec<String>>,
    calls: Vec<(FaultOp, String)>,
}

/// In-process transport with scripted failures, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_table(self, name: &str, rows: Vec<Row>) -> Self {
        self.set_table(name, rows);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_table(&self, name: &str, rows: Vec<Row>) {
        self.state().tables.insert(name.to_string(), rows);
    }

    #[must_use]
    pub fn table_rows(&self, name: &str) -> Vec<Row> {
        self.state().tables.get(name).cloned().unwrap_or_default()
    }

    /// Fail the next `times` calls of `op` on `table`, or every call when `times` is `None`.
    pub fn inject_fault(&self, table: &str, op: FaultOp, error: TransportError, times: Option<usize>) {
        self.state().faults.push(Fault { table: table.to_string(), op, error, remaining: times });
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Reject any upsert batch containing a row whose key equals `key`.
    pub fn poison_row(&self, table: &str, key: &Value) {
        self.state().poisoned.entry(table.to_string()).or_default().push(canonical_json(key));
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(FaultOp, String)> {
        self.state().calls.clone()
    }

    #[must_use]
    pub fn call_count(&self, op: FaultOp, table: &str) -> usize {
        self.state().calls.iter().filter(|(call_op, call_table)| *call_op == op && call_table == table).count()
    }

    fn enter(&self, op: FaultOp, table: &str) -> Result<MutexGuard<'_, MemoryState>, TransportError> {
        let mut state = self.state();
        state.calls.push((op, table.to_string()));
        let hit = state.faults.iter_mut().find(|fault| {
            fault.op == op && fault.table == table && fault.remaining.map_or(true, |left| left > 0)
        });
        if let Some(fault) = hit {
            if let Some(left) = fault.remaining.as_mut() {
                *left -= 1;
            }
            return Err(fault.error.clone());
        }
        Ok(state)
    }
}

impl TableTransport for MemoryTransport {
    fn fetch_page(&self, table: &str, offset: u64, page_size: usize) -> Result<Page, TransportError> {
        let state = self.enter(FaultOp::Fetch, table)?;
        let rows = state.tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(page_of(rows, offset, page_size))
    }

    fn upsert_batch(
        &self,
        table: &str,
        key_column: &str,
        rows: &[Row],
        exclude_columns: &[String],
    ) -> Result<UpsertOutcome, TransportError> {
        let mut state = self.enter(FaultOp::Upsert, table)?;
        if let Some(poisoned) = state.poisoned.get(table) {
            let bad = rows
                .iter()
                .filter_map(|row| row.get(key_column).map(canonical_json))
                .find(|key| poisoned.contains(key));
            if let Some(key) = bad {
                return Err(TransportError::fatal(format!("row {key} violates a constraint on `{table}`")));
            }
        }
        let existing = state.tables.entry(table.to_string()).or_default();
        Ok(merge_rows(existing, key_column, rows, exclude_columns))
    }

    fn count_rows(&self, table: &str) -> Result<u64, TransportError> {
        let state = self.enter(FaultOp::Count, table)?;
        state.tables.get(table).map(|rows| rows.len() as u64).ok_or_else(|| missing_table(table))
    }

    fn delete_rows(&self, table: &str, key_column: &str, keys: &[Value]) -> Result<usize, TransportError> {
        let mut state = self.enter(FaultOp::Delete, table)?;
        Ok(state.tables.get_mut(table).map_or(0, |rows| remove_keys(rows, key_column, keys)))
    }

    fn list_tables(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.state().tables.keys().cloned().collect())
    }
}

fn missing_table(table: &str) -> TransportError {
    TransportError::fatal(format!("relation `{table}` does not exist"))
}
