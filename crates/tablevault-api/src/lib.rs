//! Backup and restore engine for tables behind a row-oriented API.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tablevault_core::{RestoreId, RestoreKind, RestoreRecord, SnapshotId, SnapshotSummary, TableTransport};
use tablevault_store::journal::{BackupRun, SchemaStatus};
use tablevault_store::{Journal, RetentionReport, SnapshotStore, SAFETY_PREFIX, SNAPSHOT_PREFIX};

pub mod config;
pub mod pool;

mod backup;
mod restore;

pub use config::{discover_tables, ConfigError, RetryPolicy, VaultConfig};
pub use pool::{CancelHandle, OperationCanceller};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupOptions {
    pub force_full: bool,
    /// Overrides `backup_workers`.
    pub workers: Option<usize>,
    /// Overrides `compress`.
    pub compress: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub safe: bool,
    /// Overrides `restore_workers`.
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupReport {
    pub summary: SnapshotSummary,
    pub retention: RetentionReport,
}

pub struct TableVaultApi {
    config: VaultConfig,
    transport: Option<Arc<dyn TableTransport>>,
    cancel: OperationCanceller,
}

impl TableVaultApi {
    #[must_use]
    pub fn new(config: VaultConfig, transport: Arc<dyn TableTransport>) -> Self {
        Self { config, transport: Some(transport), cancel: OperationCanceller::new() }
    }

    /// An instance that can only list stored snapshots and journal entries.
    #[must_use]
    pub fn offline(config: VaultConfig) -> Self {
        Self { config, transport: None, cancel: OperationCanceller::new() }
    }

    #[must_use]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Cancels the operations running at the time of the call: pending
    /// tables are skipped and restores stop between batches. Operations
    /// started afterwards are unaffected.
    #[must_use]
    pub fn cancel_handle(&self) -> OperationCanceller {
        self.cancel.clone()
    }

    fn transport(&self) -> Result<&dyn TableTransport> {
        self.transport.as_deref().ok_or_else(|| anyhow::anyhow!("no table transport configured"))
    }

    fn snapshot_store(&self, compress: bool) -> Result<SnapshotStore> {
        let dir = self.config.snapshot_dir();
        Ok(SnapshotStore::open(&dir, SNAPSHOT_PREFIX, compress)
            .with_context(|| format!("failed to open snapshot area {}", dir.display()))?
            .with_primary_keys(self.config.primary_key_map()))
    }

    fn safety_store(&self) -> Result<SnapshotStore> {
        let dir = self.config.safety_dir();
        Ok(SnapshotStore::open(&dir, SAFETY_PREFIX, self.config.compress)
            .with_context(|| format!("failed to open safety area {}", dir.display()))?
            .with_primary_keys(self.config.primary_key_map()))
    }

    fn open_journal(&self) -> Result<Journal> {
        std::fs::create_dir_all(&self.config.data_dir)
            .with_context(|| format!("failed to create data dir {}", self.config.data_dir.display()))?;
        Journal::open(&self.config.journal_path())
    }

    /// # Errors
    /// Returns an error when the journal cannot be opened or queried.
    pub fn journal_status(&self) -> Result<SchemaStatus> {
        self.open_journal()?.schema_status()
    }

    /// Tables to back up: configured and schema-discovered names, or the
    /// transport's own listing when neither yields any.
    ///
    /// # Errors
    /// Returns an error when the schema file or the transport listing fails.
    pub fn discover_tables(&self) -> Result<Vec<String>> {
        let tables = self.config.resolved_tables().context("failed to read schema_sql")?;
        if !tables.is_empty() {
            return Ok(tables);
        }
        let mut listed = self.transport()?.list_tables().context("failed to list tables from the transport")?;
        listed.sort();
        Ok(listed)
    }

    /// Take one snapshot, publish it, then apply retention and journal it.
    ///
    /// Per-table fetch failures do not fail the run; they are listed in the
    /// summary's failed tables. A run in which every table failed publishes
    /// nothing, so it never displaces a good snapshot through retention.
    ///
    /// # Errors
    /// Returns an error when no tables are known, every table failed, the
    /// artifact cannot be written, or the journal write fails.
    pub fn run_backup(&self, options: BackupOptions) -> Result<BackupReport> {
        let tables = self.discover_tables()?;
        anyhow::ensure!(!tables.is_empty(), "no tables configured for backup");
        let store = self.snapshot_store(options.compress.unwrap_or(self.config.compress))?;
        let operation = self.cancel.begin();

        let collected = backup::collect_snapshot(&backup::CapturePlan {
            store: &store,
            transport: self.transport()?,
            config: &self.config,
            tables: &tables,
            workers: options.workers.unwrap_or(self.config.backup_workers),
            force_full: options.force_full,
            protects_restore_of: None,
            cancel: &operation.cancel,
        })?;
        let failed = collected.snapshot.failed_tables();
        if failed.len() == collected.snapshot.tables.len() {
            tracing::error!(failed = ?failed, "every table failed; snapshot not published");
            anyhow::bail!("backup captured no tables; failed: {}", failed.join(", "));
        }
        let (snapshot, summary) = collected.publish(&store).context("failed to publish snapshot")?;
        let retention = store.enforce_retention(self.config.retention_limit)?;
        tracing::info!(
            snapshot_id = %summary.id,
            kind = summary.kind.as_str(),
            total_rows = summary.total_rows,
            changed = snapshot.changed_tables().len(),
            failed = failed.len(),
            deleted = retention.deleted.len(),
            "backup complete"
        );

        self.open_journal()?.save_backup_summary(&summary, &retention)?;
        Ok(BackupReport { summary, retention })
    }

    /// Restore a regular snapshot. With `safe`, a safety capture of the live
    /// tables is taken first.
    ///
    /// A run that reaches the write phase returns its record whatever the
    /// outcome. Runs stopped earlier are journaled and returned as errors.
    ///
    /// # Errors
    /// Returns the aborting `VaultError` (missing target, safety capture
    /// failure, or validation defects), or a journal error.
    pub fn run_restore(&self, snapshot_id: SnapshotId, options: RestoreOptions) -> Result<RestoreRecord> {
        self.restore_from(RestoreKind::Restore, snapshot_id, options)
    }

    /// Put the live tables back to a safety capture, pruning rows created
    /// since. A fresh safety capture is always taken first.
    ///
    /// # Errors
    /// See [`TableVaultApi::run_restore`].
    pub fn run_rollback(&self, safety_capture_id: SnapshotId) -> Result<RestoreRecord> {
        self.restore_from(RestoreKind::Rollback, safety_capture_id, RestoreOptions { safe: true, workers: None })
    }

    fn restore_from(&self, kind: RestoreKind, target: SnapshotId, options: RestoreOptions) -> Result<RestoreRecord> {
        let safety = self.safety_store()?;
        let regular;
        let source = match kind {
            RestoreKind::Rollback => &safety,
            RestoreKind::Restore => {
                regular = self.snapshot_store(self.config.compress)?;
                &regular
            }
        };
        let operation = self.cancel.begin();
        let run = restore::execute(&restore::RestorePlan {
            config: &self.config,
            transport: self.transport()?,
            source,
            safety: &safety,
            kind,
            target,
            safe: options.safe,
            workers: options.workers.unwrap_or(self.config.restore_workers),
            cancel: &operation.cancel,
        })?;
        drop(operation);

        self.open_journal()?.save_restore_record(&run.record)?;
        if let Some(limit) = self.config.safety_retention_limit {
            if let Err(err) = safety.enforce_retention(limit) {
                tracing::warn!(error = %err, "safety area retention failed");
            }
        }

        match run.abort {
            Some(err) => Err(err.into()),
            None => Ok(run.record),
        }
    }

    /// # Errors
    /// Returns an error when the snapshot area cannot be scanned.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>> {
        Ok(self.snapshot_store(self.config.compress)?.list()?)
    }

    /// # Errors
    /// Returns an error when the safety area cannot be scanned.
    pub fn list_safety_captures(&self) -> Result<Vec<SnapshotSummary>> {
        Ok(self.safety_store()?.list()?)
    }

    /// # Errors
    /// Returns an error when the journal cannot be read.
    pub fn list_restore_records(&self, limit: usize) -> Result<Vec<RestoreRecord>> {
        self.open_journal()?.list_restore_records(limit)
    }

    /// # Errors
    /// Returns an error when the journal cannot be read.
    pub fn get_restore_record(&self, restore_id: RestoreId) -> Result<Option<RestoreRecord>> {
        self.open_journal()?.get_restore_record(restore_id)
    }

    /// # Errors
    /// Returns an error when the journal cannot be read.
    pub fn list_backup_summaries(&self, limit: usize) -> Result<Vec<BackupRun>> {
        self.open_journal()?.list_backup_summaries(limit)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use serde_json::{json, Value};
    use tablevault_core::{
        Page, RestoreOutcome, Row, TableEntry, TransportError, UpsertOutcome, VaultError, WireEntry,
    };
    use tablevault_transport::{FaultOp, MemoryTransport};
    use ulid::Ulid;

    use super::*;

    fn temp_config() -> VaultConfig {
        let data_dir = std::env::temp_dir().join(format!("tablevault-api-{}", Ulid::new()));
        let mut config = VaultConfig {
            data_dir,
            tables: vec!["users".to_string(), "orders".to_string()],
            batch_size: 3,
            ..VaultConfig::default()
        };
        config.retry.initial_backoff_ms = 1;
        config
    }

    fn rows(range: std::ops::RangeInclusive<i64>) -> Vec<Row> {
        range
            .filter_map(|id| match json!({"id": id, "label": format!("item {id}")}) {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()
    }

    fn seeded() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new().with_table("users", rows(1..=10)).with_table("orders", rows(1..=5)))
    }

    fn cleanup(api: &TableVaultApi) {
        let _ = std::fs::remove_dir_all(&api.config().data_dir);
    }

    fn read_artifact(path: &std::path::Path) -> Result<Value> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    // Test IDs: E2E-001
    #[test]
    fn second_backup_without_changes_only_references() -> Result<()> {
        let transport = seeded();
        let api = TableVaultApi::new(temp_config(), transport);
        let plain = BackupOptions { compress: Some(false), ..BackupOptions::default() };

        let first = api.run_backup(plain)?;
        let second = api.run_backup(plain)?;

        let path = api.config().snapshot_dir().join(&second.summary.file_name);
        let artifact = read_artifact(&path)?;
        let expected = json!({"_unchanged": true, "_reference_backup": first.summary.id.to_string()});
        for table in ["users", "orders"] {
            let Some(entry) = artifact["data"].get(table) else {
                return Err(anyhow!("artifact is missing {table}"));
            };
            assert_eq!(entry["_unchanged"], expected["_unchanged"]);
            assert_eq!(entry["_reference_backup"], expected["_reference_backup"]);
            assert!(matches!(serde_json::from_value::<WireEntry>(entry.clone())?, WireEntry::Reference { .. }));
        }
        assert_eq!(artifact["metadata"]["changed_tables"], json!([]));
        assert_eq!(artifact["metadata"]["kind"], json!("incremental"));
        assert_eq!(artifact["metadata"]["previous_snapshot_id"], json!(first.summary.id.to_string()));
        assert_eq!(artifact["metadata"]["total_rows"], json!(0));

        let history = api.list_backup_summaries(10)?;
        assert_eq!(history.len(), 2);
        assert_eq!(api.list_snapshots()?.len(), 2);
        cleanup(&api);
        Ok(())
    }

    #[test]
    fn backup_falls_back_to_transport_listing() -> Result<()> {
        let mut config = temp_config();
        config.tables.clear();
        let api = TableVaultApi::new(config, seeded());
        assert_eq!(api.discover_tables()?, vec!["orders".to_string(), "users".to_string()]);
        cleanup(&api);
        Ok(())
    }

    #[test]
    fn offline_api_lists_but_cannot_back_up() -> Result<()> {
        let api = TableVaultApi::offline(temp_config());
        assert!(api.list_snapshots()?.is_empty());
        assert!(api.list_restore_records(5)?.is_empty());
        let mut config = temp_config();
        config.tables.clear();
        let bare = TableVaultApi::offline(config);
        assert!(bare.run_backup(BackupOptions::default()).is_err());
        cleanup(&api);
        cleanup(&bare);
        Ok(())
    }

    #[test]
    fn backup_retention_applies_limit() -> Result<()> {
        let mut config = temp_config();
        config.retention_limit = 2;
        let transport = seeded();
        let api = TableVaultApi::new(config, transport.clone());

        let mut reports = Vec::new();
        for round in 0..4_i64 {
            transport.set_table("orders", rows(1..=5 + round));
            reports.push(api.run_backup(BackupOptions::default())?);
        }
        let remaining: Vec<SnapshotId> = api.list_snapshots()?.iter().map(|summary| summary.id).collect();
        assert_eq!(remaining, vec![reports[3].summary.id, reports[0].summary.id]);
        assert_eq!(reports[3].retention.pinned, vec![reports[0].summary.id]);
        assert_eq!(reports[3].retention.deleted, vec![reports[2].summary.id]);
        cleanup(&api);
        Ok(())
    }

    /// Counts safety artifacts on disk whenever a write reaches the live store.
    struct SafetyProbe {
        inner: Arc<MemoryTransport>,
        safety_dir: PathBuf,
        captures_seen_at_write: Mutex<Vec<usize>>,
    }

    impl SafetyProbe {
        fn captures_on_disk(&self) -> usize {
            std::fs::read_dir(&self.safety_dir)
                .map(|entries| {
                    entries
                        .filter_map(std::result::Result::ok)
                        .filter(|entry| entry.file_name().to_string_lossy().starts_with("safety_"))
                        .count()
                })
                .unwrap_or(0)
        }
    }

    impl TableTransport for SafetyProbe {
        fn fetch_page(&self, table: &str, offset: u64, page_size: usize) -> Result<Page, TransportError> {
            self.inner.fetch_page(table, offset, page_size)
        }

        fn upsert_batch(
            &self,
            table: &str,
            key_column: &str,
            rows: &[Row],
            exclude_columns: &[String],
        ) -> Result<UpsertOutcome, TransportError> {
            let seen = self.captures_on_disk();
            if let Ok(mut log) = self.captures_seen_at_write.lock() {
                log.push(seen);
            }
            self.inner.upsert_batch(table, key_column, rows, exclude_columns)
        }

        fn count_rows(&self, table: &str) -> Result<u64, TransportError> {
            self.inner.count_rows(table)
        }

        fn delete_rows(&self, table: &str, key_column: &str, keys: &[Value]) -> Result<usize, TransportError> {
            self.inner.delete_rows(table, key_column, keys)
        }
    }

    // Test IDs: RESTORE-001
    #[test]
    fn safe_restore_captures_once_before_any_write() -> Result<()> {
        let config = temp_config();
        let inner = seeded();
        let probe = Arc::new(SafetyProbe {
            inner: inner.clone(),
            safety_dir: config.safety_dir(),
            captures_seen_at_write: Mutex::new(Vec::new()),
        });
        let api = TableVaultApi::new(config, probe.clone());

        let backup = api.run_backup(BackupOptions::default())?;
        inner.set_table("users", rows(1..=4));
        let record = api.run_restore(backup.summary.id, RestoreOptions { safe: true, workers: Some(2) })?;

        assert_eq!(record.outcome, RestoreOutcome::Succeeded);
        let Ok(seen) = probe.captures_seen_at_write.lock() else {
            return Err(anyhow!("probe lock poisoned"));
        };
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|count| *count == 1), "every write saw exactly one capture: {seen:?}");
        drop(seen);

        let captures = api.list_safety_captures()?;
        assert_eq!(captures.len(), 1);
        assert_eq!(record.safety_capture_id, Some(captures[0].id));
        assert_eq!(captures[0].protects_restore_of, Some(backup.summary.id));
        assert_eq!(record.before_counts.get("users"), Some(&4));
        assert_eq!(record.after_counts.get("users"), Some(&10));
        cleanup(&api);
        Ok(())
    }

    // Test IDs: RESTORE-003
    #[test]
    fn rollback_returns_counts_to_pre_restore_values() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new().with_table("users", rows(1..=10)).with_table("orders", rows(1..=8)));
        let api = TableVaultApi::new(temp_config(), transport.clone());
        let backup = api.run_backup(BackupOptions::default())?;

        transport.set_table("users", rows(3..=6));
        transport.set_table("orders", rows(1..=2));
        let restore = api.run_restore(backup.summary.id, RestoreOptions { safe: true, workers: None })?;
        let Some(capture) = restore.safety_capture_id else {
            return Err(anyhow!("safe restore recorded no capture"));
        };
        assert_eq!(restore.after_counts.get("users"), Some(&10));

        let rollback = api.run_rollback(capture)?;
        assert_eq!(rollback.outcome, RestoreOutcome::RolledBack);
        assert_eq!(rollback.kind, RestoreKind::Rollback);
        for (table, before) in &restore.before_counts {
            assert_eq!(rollback.after_counts.get(table), Some(before), "table {table}");
        }
        assert_eq!(rollback.per_table_result.get("users").map(|result| result.pruned), Some(6));
        assert_eq!(transport.table_rows("users").len(), 4);
        assert!(rollback.safety_capture_id.is_some());
        assert_eq!(api.list_safety_captures()?.len(), 2);
        assert_eq!(api.list_restore_records(10)?.len(), 2);
        cleanup(&api);
        Ok(())
    }

    #[test]
    fn restoring_twice_is_idempotent() -> Result<()> {
        let transport = seeded();
        let api = TableVaultApi::new(temp_config(), transport.clone());
        let backup = api.run_backup(BackupOptions::default())?;
        transport.set_table("users", rows(5..=12));

        let first = api.run_restore(backup.summary.id, RestoreOptions::default())?;
        let second = api.run_restore(backup.summary.id, RestoreOptions::default())?;
        assert_eq!(first.after_counts, second.after_counts);
        assert_eq!(second.per_table_result.get("users").map(|result| result.inserted), Some(0));
        assert_eq!(second.per_table_result.get("users").map(|result| result.updated), Some(10));
        cleanup(&api);
        Ok(())
    }

    // Test IDs: RESTORE-004
    #[test]
    fn one_failing_table_leaves_siblings_untouched() -> Result<()> {
        let transport = seeded();
        let api = TableVaultApi::new(temp_config(), transport.clone());
        let backup = api.run_backup(BackupOptions::default())?;

        let baseline = api.run_restore(backup.summary.id, RestoreOptions::default())?;
        transport.inject_fault("orders", FaultOp::Upsert, TransportError::fatal("schema mismatch"), None);
        let faulted = api.run_restore(backup.summary.id, RestoreOptions::default())?;

        assert_eq!(faulted.outcome, RestoreOutcome::PartiallyFailed);
        assert_eq!(faulted.failed_tables(), vec!["orders".to_string()]);
        let users = |record: &RestoreRecord| record.per_table_result.get("users").map(|r| (r.inserted, r.updated));
        assert_eq!(users(&faulted), users(&baseline));
        cleanup(&api);
        Ok(())
    }

    #[test]
    fn dangling_reference_aborts_restore() -> Result<()> {
        let transport = seeded();
        let api = TableVaultApi::new(temp_config(), transport.clone());
        let first = api.run_backup(BackupOptions::default())?;
        transport.set_table("orders", rows(1..=6));
        let second = api.run_backup(BackupOptions::default())?;

        let store = api.snapshot_store(true)?;
        store.delete(first.summary.id)?;
        let err = match api.run_restore(second.summary.id, RestoreOptions { safe: true, workers: None }) {
            Ok(record) => return Err(anyhow!("restore unexpectedly finished: {:?}", record.outcome)),
            Err(err) => err,
        };
        let Some(VaultError::Validation(defects)) = err.downcast_ref::<VaultError>() else {
            return Err(anyhow!("unexpected error: {err:#}"));
        };
        assert!(defects.iter().any(|defect| defect.contains("users")));
        assert_eq!(transport.call_count(FaultOp::Upsert, "users"), 0);

        let records = api.list_restore_records(5)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, RestoreOutcome::Aborted);
        assert!(records[0].error.is_some());
        cleanup(&api);
        Ok(())
    }

    /// Cancels the owning API's running operations on the first fetch of `table`.
    struct CancelOnFetch {
        inner: Arc<MemoryTransport>,
        table: &'static str,
        canceller: Mutex<Option<OperationCanceller>>,
    }

    impl TableTransport for CancelOnFetch {
        fn fetch_page(&self, table: &str, offset: u64, page_size: usize) -> Result<Page, TransportError> {
            if table == self.table {
                if let Some(canceller) = self.canceller.lock().ok().and_then(|mut slot| slot.take()) {
                    canceller.cancel();
                }
            }
            self.inner.fetch_page(table, offset, page_size)
        }

        fn upsert_batch(
            &self,
            table: &str,
            key_column: &str,
            rows: &[Row],
            exclude_columns: &[String],
        ) -> Result<UpsertOutcome, TransportError> {
            self.inner.upsert_batch(table, key_column, rows, exclude_columns)
        }

        fn count_rows(&self, table: &str) -> Result<u64, TransportError> {
            self.inner.count_rows(table)
        }
    }

    #[test]
    fn cancel_skips_pending_tables_of_running_backup_only() -> Result<()> {
        let transport = Arc::new(CancelOnFetch { inner: seeded(), table: "users", canceller: Mutex::new(None) });
        let api = TableVaultApi::new(temp_config(), transport.clone());
        if let Ok(mut slot) = transport.canceller.lock() {
            *slot = Some(api.cancel_handle());
        }
        let single = BackupOptions { workers: Some(1), ..BackupOptions::default() };

        let cancelled = api.run_backup(single)?;
        assert_eq!(cancelled.summary.failed_tables(), vec!["orders".to_string()]);
        let store = api.snapshot_store(true)?;
        let stored = store.read(cancelled.summary.id)?;
        assert!(matches!(stored.tables.get("orders"), Some(TableEntry::Failed { error }) if error == "operation cancelled"));
        assert_eq!(api.cancel_handle().running(), 0);

        let next = api.run_backup(single)?;
        assert!(next.summary.failed_tables().is_empty());
        cleanup(&api);
        Ok(())
    }

    #[test]
    fn backup_with_every_table_failed_is_not_published() -> Result<()> {
        let transport = seeded();
        let api = TableVaultApi::new(temp_config(), transport.clone());
        let good = api.run_backup(BackupOptions::default())?;
        for table in ["users", "orders"] {
            transport.inject_fault(table, FaultOp::Fetch, TransportError::fatal("permission denied"), None);
        }

        let Err(err) = api.run_backup(BackupOptions::default()) else {
            return Err(anyhow!("a backup with no captured table must fail"));
        };
        assert!(err.to_string().contains("captured no tables"));
        let listed: Vec<SnapshotId> = api.list_snapshots()?.iter().map(|summary| summary.id).collect();
        assert_eq!(listed, vec![good.summary.id]);
        cleanup(&api);
        Ok(())
    }
}
