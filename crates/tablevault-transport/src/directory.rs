use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tablevault_core::{Page, Row, TableTransport, TransportError, UpsertOutcome};
use ulid::Ulid;

use crate::{merge_rows, page_of, remove_keys};

/// Tables stored as `<dir>/<table>.json`, each a JSON array of row objects.
///
/// Useful for offline restores and for seeding a live database from fixtures.
#[derive(Debug)]
pub struct DirectoryTransport {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirectoryTransport {
    /// # Errors
    /// Returns a fatal error when `root` cannot be created.
    pub fn open(root: &Path) -> Result<Self, TransportError> {
        fs::create_dir_all(root)
            .map_err(|err| TransportError::fatal(format!("failed to create {}: {err}", root.display())))?;
        Ok(Self { root: root.to_path_buf(), write_lock: Mutex::new(()) })
    }

    fn table_path(&self, table: &str) -> Result<PathBuf, TransportError> {
        if table.is_empty() || table.contains(['/', '\\']) || table.starts_with('.') {
            return Err(TransportError::fatal(format!("invalid table name `{table}`")));
        }
        Ok(self.root.join(format!("{table}.json")))
    }

    fn load(&self, table: &str) -> Result<Vec<Row>, TransportError> {
        let path = self.table_path(table)?;
        let bytes = fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                TransportError::fatal(format!("relation `{table}` does not exist"))
            } else {
                TransportError::retryable(format!("failed to read {}: {err}", path.display()))
            }
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|err| TransportError::fatal(format!("{} is not a JSON row array: {err}", path.display())))
    }

    fn load_or_empty(&self, table: &str) -> Result<Vec<Row>, TransportError> {
        if !self.table_path(table)?.exists() {
            tracing::debug!(table, "creating table file");
            return Ok(Vec::new());
        }
        self.load(table)
    }

    fn store(&self, table: &str, rows: &[Row]) -> Result<(), TransportError> {
        let path = self.table_path(table)?;
        let temp = self.root.join(format!(".{table}.json.tmp-{}", Ulid::new()));
        let bytes = serde_json::to_vec_pretty(rows)
            .map_err(|err| TransportError::fatal(format!("failed to encode `{table}`: {err}")))?;
        fs::write(&temp, bytes)
            .and_then(|()| fs::rename(&temp, &path))
            .map_err(|err| {
                let _ = fs::remove_file(&temp);
                TransportError::retryable(format!("failed to write {}: {err}", path.display()))
            })
    }
}

impl TableTransport for DirectoryTransport {
    fn fetch_page(&self, table: &str, offset: u64, page_size: usize) -> Result<Page, TransportError> {
        Ok(page_of(&self.load(table)?, offset, page_size))
    }

    fn upsert_batch(
        &self,
        table: &str,
        key_column: &str,
        rows: &[Row],
        exclude_columns: &[String],
    ) -> Result<UpsertOutcome, TransportError> {
        let _guard = self.write_lock.lock().map_err(|_| TransportError::fatal("directory lock poisoned"))?;
        let mut existing = self.load_or_empty(table)?;
        let outcome = merge_rows(&mut existing, key_column, rows, exclude_columns);
        self.store(table, &existing)?;
        Ok(outcome)
    }

    fn count_rows(&self, table: &str) -> Result<u64, TransportError> {
        Ok(self.load(table)?.len() as u64)
    }

    fn delete_rows(&self, table: &str, key_column: &str, keys: &[Value]) -> Result<usize, TransportError> {
        let _guard = self.write_lock.lock().map_err(|_| TransportError::fatal("directory lock poisoned"))?;
        let mut existing = self.load(table)?;
        let removed = remove_keys(&mut existing, key_column, keys);
        self.store(table, &existing)?;
        Ok(removed)
    }

    fn list_tables(&self) -> Result<Vec<String>, TransportError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|err| TransportError::fatal(format!("failed to read {}: {err}", self.root.display())))?;
        let mut tables: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").filter(|stem| !stem.starts_with('.')).map(str::to_string)
            })
            .collect();
        tables.sort();
        Ok(tables)
    }
}
