//! SQLite journal of restore records and backup runs.
//!
//! Snapshot payloads live in the artifact areas; the journal only keeps the
//! audit trail so history survives retention.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tablevault_core::{RestoreId, RestoreRecord, SnapshotSummary};
use time::OffsetDateTime;

use crate::RetentionReport;

pub const JOURNAL_FILE: &str = "journal.sqlite3";

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS restore_records (
  restore_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('restore','rollback')),
  target_snapshot_id TEXT NOT NULL,
  safety_capture_id TEXT,
  outcome TEXT NOT NULL CHECK (outcome IN ('succeeded','partially_failed','rolled_back','failed_needs_manual_rollback','aborted')),
  started_at TEXT NOT NULL,
  completed_at TEXT NOT NULL,
  record_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_restore_records_completed ON restore_records(completed_at);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS backup_runs (
  snapshot_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('full','incremental')),
  created_at TEXT NOT NULL,
  total_tables INTEGER NOT NULL CHECK (total_tables >= 0),
  total_rows INTEGER NOT NULL CHECK (total_rows >= 0),
  failed_tables INTEGER NOT NULL CHECK (failed_tables >= 0),
  retention_deleted INTEGER NOT NULL DEFAULT 0,
  summary_json TEXT NOT NULL
);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRun {
    pub summary: SnapshotSummary,
    pub retention_deleted: usize,
}

pub struct Journal {
    conn: Connection,
}

impl Journal {
    /// Open the journal database and apply pending migrations.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, configured, or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open journal database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let mut journal = Self { conn };
        journal.migrate()?;
        Ok(journal)
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect();
        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        for (target, sql) in [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)] {
            if version < target {
                let tx = self.conn.transaction().context("failed to start migration transaction")?;
                tx.execute_batch(sql).with_context(|| format!("failed to apply migration {target}"))?;
                record_schema_version(&tx, target)?;
                tx.commit().with_context(|| format!("failed to commit migration {target}"))?;
            }
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!("unsupported journal schema version {version}; expected {LATEST_SCHEMA_VERSION}"));
        }
        Ok(())
    }

    /// Persist a sealed restore record.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn save_restore_record(&mut self, record: &RestoreRecord) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO restore_records(
               restore_id, kind, target_snapshot_id, safety_capture_id, outcome,
               started_at, completed_at, record_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.restore_id.to_string(),
                record.kind.as_str(),
                record.target_snapshot_id.to_string(),
                record.safety_capture_id.map(|id| id.to_string()),
                record.outcome.as_str(),
                rfc3339(record.started_at)?,
                rfc3339(record.completed_at)?,
                serde_json::to_string(record).context("failed to serialize restore record")?,
            ],
        )
        .with_context(|| format!("failed to persist restore record {}", record.restore_id))?;
        tx.commit().context("failed to commit restore record transaction")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn get_restore_record(&self, restore_id: RestoreId) -> Result<Option<RestoreRecord>> {
        let value = self
            .conn
            .query_row(
                "SELECT record_json FROM restore_records WHERE restore_id = ?1",
                params![restore_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to query restore record")?;

        value
            .map(|json| serde_json::from_str(&json).context("failed to deserialize stored restore record"))
            .transpose()
    }

    /// Restore records, most recent first.
    ///
    /// # Errors
    /// Returns an error when the query or deserialization fails.
    pub fn list_restore_records(&self, limit: usize) -> Result<Vec<RestoreRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_json FROM restore_records
             ORDER BY completed_at DESC, restore_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            row.get::<_, String>(0)
        })?;

        let mut records = Vec::new();
        for row in rows {
            let json = row.context("failed to read restore record row")?;
            records.push(serde_json::from_str(&json).context("failed to deserialize stored restore record")?);
        }
        Ok(records)
    }

    /// Record a completed backup run.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn save_backup_summary(&mut self, summary: &SnapshotSummary, retention: &RetentionReport) -> Result<()> {
        let run = BackupRun { summary: summary.clone(), retention_deleted: retention.deleted.len() };
        self.conn
            .execute(
                "INSERT INTO backup_runs(
                   snapshot_id, kind, created_at, total_tables, total_rows, failed_tables,
                   retention_deleted, summary_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    summary.id.to_string(),
                    summary.kind.as_str(),
                    rfc3339(summary.created_at)?,
                    i64::try_from(summary.total_tables)?,
                    i64::try_from(summary.total_rows)?,
                    i64::try_from(summary.failed_tables().len())?,
                    i64::try_from(run.retention_deleted)?,
                    serde_json::to_string(&run).context("failed to serialize backup run")?,
                ],
            )
            .with_context(|| format!("failed to persist backup run {}", summary.id))?;
        Ok(())
    }

    /// Backup runs, most recent first.
    ///
    /// # Errors
    /// Returns an error when the query or deserialization fails.
    pub fn list_backup_summaries(&self, limit: usize) -> Result<Vec<BackupRun>> {
        let mut stmt = self
            .conn
            .prepare("SELECT summary_json FROM backup_runs ORDER BY snapshot_id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            row.get::<_, String>(0)
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let json = row.context("failed to read backup run row")?;
            runs.push(serde_json::from_str(&json).context("failed to deserialize stored backup run")?);
        }
        Ok(runs)
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get::<_, i64>(0))
        .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, rfc3339(OffsetDateTime::now_utc())?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
