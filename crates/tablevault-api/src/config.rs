//! YAML configuration for backup and restore runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tablevault_core::{
    DEFAULT_BACKUP_WORKERS, DEFAULT_BATCH_SIZE, DEFAULT_PAGE_SIZE, DEFAULT_PRIMARY_KEY,
    DEFAULT_RESTORE_WORKERS, DEFAULT_RETENTION_LIMIT, PrimaryKeys,
};
use tablevault_store::journal::JOURNAL_FILE;
use tablevault_store::{SAFETY_AREA, SNAPSHOT_AREA};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based), doubling from the initial backoff.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: default_max_attempts(), initial_backoff_ms: default_initial_backoff_ms() }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultConfig {
    /// Root of the snapshot, safety, and journal storage.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub tables: Vec<String>,
    /// DDL file scanned for `CREATE TABLE public.<name>` statements.
    #[serde(default)]
    pub schema_sql: Option<PathBuf>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub primary_keys: BTreeMap<String, String>,
    /// Tables that must be present and non-empty for a restore to proceed.
    #[serde(default)]
    pub critical_tables: Vec<String>,
    #[serde(default)]
    pub excluded_columns: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub global_excluded_columns: Vec<String>,
    #[serde(default = "default_retention_limit")]
    pub retention_limit: usize,
    #[serde(default)]
    pub safety_retention_limit: Option<usize>,
    #[serde(default = "default_backup_workers")]
    pub backup_workers: usize,
    #[serde(default = "default_restore_workers")]
    pub restore_workers: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_compress")]
    pub compress: bool,
    /// Error rows a table may accumulate before it is marked failed.
    #[serde(default)]
    pub max_table_errors: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./tablevault-data")
}

fn default_primary_key() -> String {
    DEFAULT_PRIMARY_KEY.to_string()
}

fn default_retention_limit() -> usize {
    DEFAULT_RETENTION_LIMIT
}

fn default_backup_workers() -> usize {
    DEFAULT_BACKUP_WORKERS
}

fn default_restore_workers() -> usize {
    DEFAULT_RESTORE_WORKERS
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_compress() -> bool {
    true
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tables: Vec::new(),
            schema_sql: None,
            primary_key: default_primary_key(),
            primary_keys: BTreeMap::new(),
            critical_tables: Vec::new(),
            excluded_columns: BTreeMap::new(),
            global_excluded_columns: Vec::new(),
            retention_limit: default_retention_limit(),
            safety_retention_limit: None,
            backup_workers: default_backup_workers(),
            restore_workers: default_restore_workers(),
            page_size: default_page_size(),
            batch_size: default_batch_size(),
            compress: default_compress(),
            max_table_errors: 0,
            retry: RetryPolicy::default(),
        }
    }
}

impl VaultConfig {
    /// Load and validate a YAML config file.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or validated.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: VaultConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Validation`] naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("retention_limit", self.retention_limit),
            ("backup_workers", self.backup_workers),
            ("restore_workers", self.restore_workers),
            ("page_size", self.page_size),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be at least 1")));
            }
        }
        if self.safety_retention_limit == Some(0) {
            return Err(ConfigError::Validation("safety_retention_limit must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation("retry.max_attempts must be at least 1".into()));
        }
        if self.primary_key.trim().is_empty() {
            return Err(ConfigError::Validation("primary_key cannot be empty".into()));
        }
        for table in self.tables.iter().chain(&self.critical_tables).chain(self.primary_keys.keys()) {
            if !is_identifier(table) {
                return Err(ConfigError::Validation(format!(
                    "table name `{table}` must contain only alphanumeric characters and underscores"
                )));
            }
        }
        Ok(())
    }

    /// Configured tables plus any discovered in `schema_sql`, without duplicates.
    ///
    /// # Errors
    /// Returns [`ConfigError::Io`] when the schema file cannot be read.
    pub fn resolved_tables(&self) -> Result<Vec<String>, ConfigError> {
        let mut tables = self.tables.clone();
        if let Some(path) = &self.schema_sql {
            let schema = std::fs::read_to_string(path)?;
            for name in discover_tables(&schema) {
                if !tables.contains(&name) {
                    tables.push(name);
                }
            }
        }
        Ok(tables)
    }

    #[must_use]
    pub fn key_for(&self, table: &str) -> &str {
        self.primary_keys.get(table).map_or(self.primary_key.as_str(), String::as_str)
    }

    #[must_use]
    pub fn primary_key_map(&self) -> PrimaryKeys {
        PrimaryKeys::new(self.primary_key.clone(), self.primary_keys.clone())
    }

    #[must_use]
    pub fn excluded_for(&self, table: &str) -> Vec<String> {
        let mut columns = self.global_excluded_columns.clone();
        for column in self.excluded_columns.get(table).into_iter().flatten() {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        columns
    }

    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_AREA)
    }

    #[must_use]
    pub fn safety_dir(&self) -> PathBuf {
        self.data_dir.join(SAFETY_AREA)
    }

    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(JOURNAL_FILE)
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Table names declared by `CREATE TABLE [IF NOT EXISTS] [public.]<name>` statements,
/// in order of first appearance. Tables in other schemas are ignored.
#[must_use]
pub fn discover_tables(schema_sql: &str) -> Vec<String> {
    let tokens: Vec<&str> = schema_sql.split_whitespace().collect();
    let mut tables = Vec::new();
    let mut idx = 0;
    while idx + 2 < tokens.len() {
        if !(tokens[idx].eq_ignore_ascii_case("create") && tokens[idx + 1].eq_ignore_ascii_case("table")) {
            idx += 1;
            continue;
        }
        let mut name_idx = idx + 2;
        if tokens.get(name_idx).is_some_and(|t| t.eq_ignore_ascii_case("if"))
            && tokens.get(name_idx + 1).is_some_and(|t| t.eq_ignore_ascii_case("not"))
            && tokens.get(name_idx + 2).is_some_and(|t| t.eq_ignore_ascii_case("exists"))
        {
            name_idx += 3;
        }
        if let Some(name) = tokens.get(name_idx).and_then(|raw| table_name(raw)) {
            if !tables.contains(&name) {
                tables.push(name);
            }
        }
        idx = name_idx;
    }
    tables
}

fn table_name(raw: &str) -> Option<String> {
    let head = raw.split('(').next().unwrap_or(raw);
    let unquoted = head.replace('"', "");
    let name = match unquoted.split_once('.') {
        Some((schema, name)) if schema.eq_ignore_ascii_case("public") => name,
        Some(_) => return None,
        None => unquoted.as_str(),
    };
    is_identifier(name).then(|| name.to_string())
}
