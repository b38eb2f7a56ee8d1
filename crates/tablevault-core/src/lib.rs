use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

mod restore;

pub use restore::{
    CountMismatch, MismatchKind, RestoreDraft, RestoreEvent, RestoreId, RestoreKind,
    RestoreMachine, RestoreOutcome, RestoreRecord, RestoreState, TableRestoreResult,
};

/// One record as returned by a table transport. Column order is irrelevant.
pub type Row = Map<String, Value>;

pub const DEFAULT_PRIMARY_KEY: &str = "id";
pub const DEFAULT_RETENTION_LIMIT: usize = 288;
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BACKUP_WORKERS: usize = 5;
pub const DEFAULT_RESTORE_WORKERS: usize = 3;
/// Upper bound on back-reference hops followed while resolving a table.
pub const MAX_CHAIN_HOPS: usize = 16;
pub const HASH_PREFIX: &str = "sha256:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SnapshotId(pub Ulid);

impl SnapshotId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Generate an id strictly greater than `previous`, so ids sort in creation order
    /// even when two snapshots land in the same millisecond.
    #[must_use]
    pub fn next_after(previous: Option<SnapshotId>) -> Self {
        let candidate = Ulid::new();
        match previous {
            Some(prev) if candidate <= prev.0 => Self(prev.0.increment().unwrap_or(candidate)),
            _ => Self(candidate),
        }
    }

    /// Parse the canonical 26-character ULID text form.
    ///
    /// # Errors
    /// Returns [`VaultError::Validation`] when `raw` is not a valid ULID.
    pub fn parse(raw: &str) -> Result<Self, VaultError> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|err| VaultError::Validation(vec![format!("invalid snapshot id `{raw}`: {err}")]))
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order-insensitive fingerprint of a table's rows, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Retryable,
    Fatal,
    Conflict,
}

impl TransportErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
            Self::Conflict => "conflict",
        }
    }
}

impl Display for TransportErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{kind} transport error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Retryable, message: message.into() }
    }

    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Fatal, message: message.into() }
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Conflict, message: message.into() }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == TransportErrorKind::Retryable
    }
}

/// Reason a back-reference chain could not be followed to materialized rows.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum ChainFault {
    Cycle { revisited: SnapshotId },
    DanglingReference { missing: SnapshotId },
    MissingTable { snapshot: SnapshotId },
    FailedEntry { snapshot: SnapshotId },
    CorruptLink { snapshot: SnapshotId, reason: String },
    TooManyHops { limit: usize },
}

impl Display for ChainFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cycle { revisited } => write!(f, "reference cycle through {revisited}"),
            Self::DanglingReference { missing } => write!(f, "referenced snapshot {missing} is missing"),
            Self::MissingTable { snapshot } => write!(f, "table absent from referenced snapshot {snapshot}"),
            Self::FailedEntry { snapshot } => write!(f, "table failed in referenced snapshot {snapshot}"),
            Self::CorruptLink { snapshot, reason } => {
                write!(f, "referenced snapshot {snapshot} is unreadable: {reason}")
            }
            Self::TooManyHops { limit } => write!(f, "exceeded {limit} reference hops"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum VaultError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("cannot resolve table `{table}`: {fault} (chain: {})", format_chain(.chain))]
    ChainResolution { table: String, chain: Vec<SnapshotId>, fault: ChainFault },
    #[error("snapshot not found: {0}")]
    NotFound(SnapshotId),
    #[error("corrupt snapshot artifact {artifact}: {reason}")]
    Corrupt { artifact: String, reason: String },
    #[error("io failure: {0}")]
    Io(String),
    #[error("safety capture failed: {0}")]
    SafetyCapture(String),
    #[error("invalid restore transition from {from} on {event}")]
    InvalidTransition { from: RestoreState, event: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl VaultError {
    #[must_use]
    pub fn corrupt(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt { artifact: artifact.into(), reason: reason.into() }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

fn format_chain(chain: &[SnapshotId]) -> String {
    chain.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
}

// Row canonicalization and hashing.

/// Render a JSON value with object keys sorted recursively and no insignificant whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical rendering of a whole row, independent of column order.
#[must_use]
pub fn canonical_row(row: &Row) -> String {
    let mut out = String::new();
    write_canonical_object(row, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_canonical_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (idx, key) in keys.into_iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        if let Some(value) = map.get(key) {
            write_canonical(value, out);
        }
    }
    out.push('}');
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

/// Total order over key values: by JSON type first, then numerically or lexically.
#[must_use]
pub fn compare_key_values(left: &Value, right: &Value) -> Ordering {
    type_rank(left).cmp(&type_rank(right)).then_with(|| match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a_float = a.as_f64().unwrap_or(0.0);
            let b_float = b.as_f64().unwrap_or(0.0);
            a_float.total_cmp(&b_float).then_with(|| a.to_string().cmp(&b.to_string()))
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (a, b) => canonical_json(a).cmp(&canonical_json(b)),
    })
}

/// Fingerprint a table's rows so that row order and column order do not matter.
///
/// Rows are sorted by `key_column` when every row carries a non-null value for it,
/// and by their full canonical serialization otherwise. Either order is total, so
/// any permutation of the same rows produces the same digest.
#[must_use]
pub fn content_hash(rows: &[Row], key_column: Option<&str>) -> ContentHash {
    let mut prepared: Vec<(Option<&Value>, String)> = rows
        .iter()
        .map(|row| (key_column.and_then(|key| row.get(key)).filter(|v| !v.is_null()), canonical_row(row)))
        .collect();

    let keyed = key_column.is_some() && prepared.iter().all(|(key, _)| key.is_some());
    if keyed {
        prepared.sort_by(|(left_key, left_row), (right_key, right_row)| {
            let key_order = match (left_key, right_key) {
                (Some(a), Some(b)) => compare_key_values(a, b),
                _ => Ordering::Equal,
            };
            key_order.then_with(|| left_row.cmp(right_row))
        });
    } else {
        prepared.sort_by(|(_, left_row), (_, right_row)| left_row.cmp(right_row));
    }

    let mut hasher = Sha256::new();
    hasher.update(format!("rows:{}\n", prepared.len()).as_bytes());
    for (_, canonical) in &prepared {
        hasher.update(canonical.as_bytes());
        hasher.update(b"\n");
    }
    ContentHash(format!("{HASH_PREFIX}{:x}", hasher.finalize()))
}

/// Remove the listed columns from every row.
#[must_use]
pub fn strip_columns(rows: &[Row], excluded: &[String]) -> Vec<Row> {
    if excluded.is_empty() {
        return rows.to_vec();
    }
    rows.iter()
        .map(|row| {
            row.iter()
                .filter(|(column, _)| !excluded.iter().any(|ex| ex == *column))
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect()
        })
        .collect()
}

/// Primary-key values added and removed between two versions of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDelta {
    pub added: usize,
    pub removed: usize,
}

#[must_use]
pub fn key_delta(current: &[Row], previous: &[Row], key_column: &str) -> KeyDelta {
    let keys = |rows: &[Row]| -> BTreeSet<String> {
        rows.iter().filter_map(|row| row.get(key_column)).map(canonical_json).collect()
    };
    let current_keys = keys(current);
    let previous_keys = keys(previous);
    KeyDelta {
        added: current_keys.difference(&previous_keys).count(),
        removed: previous_keys.difference(&current_keys).count(),
    }
}

// Change detection.

/// Per-table primary key columns, falling back to one default column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeys {
    default: String,
    per_table: BTreeMap<String, String>,
}

impl PrimaryKeys {
    #[must_use]
    pub fn new(default: impl Into<String>, per_table: BTreeMap<String, String>) -> Self {
        Self { default: default.into(), per_table }
    }

    #[must_use]
    pub fn key_for(&self, table: &str) -> &str {
        self.per_table.get(table).map_or(self.default.as_str(), String::as_str)
    }
}

impl Default for PrimaryKeys {
    fn default() -> Self {
        Self::new(DEFAULT_PRIMARY_KEY, BTreeMap::new())
    }
}

/// What the previous snapshot knows about one table, after following back-references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorState {
    NoPreviousSnapshot,
    Absent,
    Resolved { materialized_in: SnapshotId, content_hash: ContentHash },
    Unresolved { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "classification", rename_all = "snake_case")]
pub enum Classification {
    Changed,
    Unchanged { reference: SnapshotId },
    Unknown,
}

impl Classification {
    /// Only a proven-identical table may be stored as a reference.
    #[must_use]
    pub fn requires_payload(&self) -> bool {
        !matches!(self, Self::Unchanged { .. })
    }
}

/// Decide whether a table can be stored as a back-reference.
///
/// The reference always points at the snapshot that physically holds the rows,
/// never at an intermediate reference, so chains stay one hop long.
#[must_use]
pub fn classify(current: &ContentHash, prior: &PriorState) -> Classification {
    match prior {
        PriorState::NoPreviousSnapshot | PriorState::Unresolved { .. } => Classification::Unknown,
        PriorState::Absent => Classification::Changed,
        PriorState::Resolved { materialized_in, content_hash } if content_hash == current => {
            Classification::Unchanged { reference: *materialized_in }
        }
        PriorState::Resolved { .. } => Classification::Changed,
    }
}

// Snapshot model.

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Full,
    Incremental,
}

impl SnapshotKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableEntry {
    Materialized { rows: Vec<Row>, content_hash: ContentHash },
    Deferred { reference_snapshot_id: SnapshotId, content_hash: Option<ContentHash> },
    Failed { error: String },
}

impl TableEntry {
    #[must_use]
    pub fn materialized(rows: Vec<Row>, key_column: Option<&str>) -> Self {
        let content_hash = content_hash(&rows, key_column);
        Self::Materialized { rows, content_hash }
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        match self {
            Self::Materialized { rows, .. } => rows.len(),
            Self::Deferred { .. } | Self::Failed { .. } => 0,
        }
    }

    #[must_use]
    pub fn content_hash(&self) -> Option<&ContentHash> {
        match self {
            Self::Materialized { content_hash, .. } => Some(content_hash),
            Self::Deferred { content_hash, .. } => content_hash.as_ref(),
            Self::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub kind: SnapshotKind,
    pub created_at: OffsetDateTime,
    pub previous_snapshot_id: Option<SnapshotId>,
    /// Set on safety captures: the snapshot whose restore this capture guards.
    pub protects_restore_of: Option<SnapshotId>,
    pub tables: BTreeMap<String, TableEntry>,
}

impl Snapshot {
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.tables.values().map(TableEntry::row_count).sum()
    }

    #[must_use]
    pub fn changed_tables(&self) -> Vec<String> {
        self.tables_where(|entry| matches!(entry, TableEntry::Materialized { .. }))
    }

    #[must_use]
    pub fn unchanged_tables(&self) -> Vec<String> {
        self.tables_where(|entry| matches!(entry, TableEntry::Deferred { .. }))
    }

    #[must_use]
    pub fn failed_tables(&self) -> Vec<String> {
        self.tables_where(|entry| matches!(entry, TableEntry::Failed { .. }))
    }

    fn tables_where(&self, predicate: impl Fn(&TableEntry) -> bool) -> Vec<String> {
        self.tables.iter().filter(|(_, entry)| predicate(entry)).map(|(name, _)| name.clone()).collect()
    }

    /// Snapshots this one depends on for table payloads.
    #[must_use]
    pub fn referenced_snapshots(&self) -> BTreeSet<SnapshotId> {
        self.tables
            .values()
            .filter_map(|entry| match entry {
                TableEntry::Deferred { reference_snapshot_id, .. } => Some(*reference_snapshot_id),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn metadata(&self) -> SnapshotMetadata {
        let table_hashes = self
            .tables
            .iter()
            .filter_map(|(name, entry)| entry.content_hash().map(|hash| (name.clone(), hash.clone())))
            .collect();
        SnapshotMetadata {
            id: self.id,
            kind: self.kind,
            created_at: self.created_at,
            total_tables: self.tables.len(),
            total_rows: self.total_rows(),
            previous_snapshot_id: self.previous_snapshot_id,
            changed_tables: self.changed_tables(),
            unchanged_tables: self.unchanged_tables(),
            failed_tables: self.failed_tables(),
            table_hashes,
            referenced_snapshots: self.referenced_snapshots().into_iter().collect(),
            protects_restore_of: self.protects_restore_of,
        }
    }

    #[must_use]
    pub fn to_document(&self) -> SnapshotDocument {
        let data = self
            .tables
            .iter()
            .map(|(name, entry)| {
                let wire = match entry {
                    TableEntry::Materialized { rows, .. } => WireEntry::Rows(rows.clone()),
                    TableEntry::Deferred { reference_snapshot_id, content_hash } => WireEntry::Reference {
                        unchanged: true,
                        reference_backup: *reference_snapshot_id,
                        hash: content_hash.clone(),
                    },
                    TableEntry::Failed { error } => {
                        WireEntry::Failed { backup_failed: true, error: error.clone() }
                    }
                };
                (name.clone(), wire)
            })
            .collect();
        SnapshotDocument { metadata: self.metadata(), data }
    }

    /// Rebuild a snapshot from its persisted document, checking structural invariants.
    ///
    /// `artifact` names the source file in error messages. `keys` orders rows
    /// when a payload's hash has to be recomputed because `table_hashes` lacks it.
    ///
    /// A full snapshot may omit the table lists; they are derived from `data`.
    /// When any list is present, or the snapshot is incremental, the lists must
    /// cover every table in `data`.
    ///
    /// # Errors
    /// Returns [`VaultError::Corrupt`] when the document violates a structural invariant.
    pub fn from_document(
        document: SnapshotDocument,
        artifact: &str,
        keys: &PrimaryKeys,
    ) -> Result<Self, VaultError> {
        let SnapshotDocument { metadata, data } = document;
        let mut defects = Vec::new();

        if metadata.kind == SnapshotKind::Incremental && metadata.previous_snapshot_id.is_none() {
            defects.push("incremental snapshot has no previous_snapshot_id".to_string());
        }
        if metadata.total_tables != data.len() {
            defects.push(format!(
                "total_tables is {} but data holds {} tables",
                metadata.total_tables,
                data.len()
            ));
        }

        let mut tables = BTreeMap::new();
        for (name, wire) in data {
            let entry = match wire {
                WireEntry::Rows(rows) => {
                    let content_hash = metadata.table_hashes.get(&name).cloned().unwrap_or_else(|| {
                        content_hash(&rows, Some(keys.key_for(&name)))
                    });
                    TableEntry::Materialized { rows, content_hash }
                }
                WireEntry::Reference { unchanged, reference_backup, hash } => {
                    if !unchanged {
                        defects.push(format!("table `{name}` reference entry has _unchanged=false"));
                    }
                    if metadata.kind == SnapshotKind::Full {
                        defects.push(format!("full snapshot defers table `{name}`"));
                    }
                    let content_hash = hash.or_else(|| metadata.table_hashes.get(&name).cloned());
                    TableEntry::Deferred { reference_snapshot_id: reference_backup, content_hash }
                }
                WireEntry::Failed { error, .. } => TableEntry::Failed { error },
            };
            tables.insert(name, entry);
        }

        for name in &metadata.changed_tables {
            if !matches!(tables.get(name), Some(TableEntry::Materialized { .. })) {
                defects.push(format!("changed table `{name}` has no row payload"));
            }
        }
        for name in &metadata.unchanged_tables {
            if !matches!(tables.get(name), Some(TableEntry::Deferred { .. })) {
                defects.push(format!("unchanged table `{name}` has no reference entry"));
            }
        }
        for name in &metadata.failed_tables {
            if !matches!(tables.get(name), Some(TableEntry::Failed { .. })) {
                defects.push(format!("failed table `{name}` has no failure marker"));
            }
        }

        let listed: BTreeSet<&String> = metadata
            .changed_tables
            .iter()
            .chain(&metadata.unchanged_tables)
            .chain(&metadata.failed_tables)
            .collect();
        if metadata.kind == SnapshotKind::Incremental || !listed.is_empty() {
            for name in tables.keys().filter(|name| !listed.contains(name)) {
                defects.push(format!("table `{name}` is missing from the metadata table lists"));
            }
        }

        if !defects.is_empty() {
            return Err(VaultError::corrupt(artifact, defects.join("; ")));
        }

        Ok(Self {
            id: metadata.id,
            kind: metadata.kind,
            created_at: metadata.created_at,
            previous_snapshot_id: metadata.previous_snapshot_id,
            protects_restore_of: metadata.protects_restore_of,
            tables,
        })
    }
}

/// Persisted metadata block. Additive keys are skipped when empty so that
/// plain backups keep the minimal shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    pub id: SnapshotId,
    pub kind: SnapshotKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub total_tables: usize,
    pub total_rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub changed_tables: Vec<String>,
    #[serde(default)]
    pub unchanged_tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_tables: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub table_hashes: BTreeMap<String, ContentHash>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_snapshots: Vec<SnapshotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protects_restore_of: Option<SnapshotId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotDocument {
    pub metadata: SnapshotMetadata,
    pub data: BTreeMap<String, WireEntry>,
}

/// Metadata-only view of a document; the data section is skipped while parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotHeader {
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WireEntry {
    Rows(Vec<Row>),
    Reference {
        #[serde(rename = "_unchanged")]
        unchanged: bool,
        #[serde(rename = "_reference_backup")]
        reference_backup: SnapshotId,
        #[serde(rename = "_hash", default, skip_serializing_if = "Option::is_none")]
        hash: Option<ContentHash>,
    },
    Failed {
        #[serde(rename = "_backup_failed")]
        backup_failed: bool,
        #[serde(rename = "_error", default)]
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TableBackupStatus {
    Changed,
    Unchanged,
    Failed,
}

/// Listing view of a stored snapshot, built from metadata alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub kind: SnapshotKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub file_name: String,
    pub size_bytes: u64,
    pub total_tables: usize,
    pub total_rows: usize,
    pub previous_snapshot_id: Option<SnapshotId>,
    pub protects_restore_of: Option<SnapshotId>,
    pub tables: BTreeMap<String, TableBackupStatus>,
}

impl SnapshotSummary {
    #[must_use]
    pub fn from_metadata(metadata: &SnapshotMetadata, file_name: String, size_bytes: u64) -> Self {
        let mut tables = BTreeMap::new();
        for name in &metadata.changed_tables {
            tables.insert(name.clone(), TableBackupStatus::Changed);
        }
        for name in &metadata.unchanged_tables {
            tables.insert(name.clone(), TableBackupStatus::Unchanged);
        }
        for name in &metadata.failed_tables {
            tables.insert(name.clone(), TableBackupStatus::Failed);
        }
        Self {
            id: metadata.id,
            kind: metadata.kind,
            created_at: metadata.created_at,
            file_name,
            size_bytes,
            total_tables: metadata.total_tables,
            total_rows: metadata.total_rows,
            previous_snapshot_id: metadata.previous_snapshot_id,
            protects_restore_of: metadata.protects_restore_of,
            tables,
        }
    }

    #[must_use]
    pub fn failed_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, status)| **status == TableBackupStatus::Failed)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

// Transport seam.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<Row>,
    /// Offset of the next page, or `None` once the table is exhausted.
    pub next: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub errors: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_details: Vec<String>,
}

/// Remote data source and sink for whole tables.
///
/// Implementations must be safe to share across worker threads.
pub trait TableTransport: Send + Sync {
    /// Fetch up to `page_size` rows starting at `offset`.
    ///
    /// # Errors
    /// Returns a [`TransportError`] classified as retryable or fatal.
    fn fetch_page(&self, table: &str, offset: u64, page_size: usize) -> Result<Page, TransportError>;

    /// Insert or update rows keyed by `key_column`, ignoring `exclude_columns`.
    ///
    /// # Errors
    /// Returns a [`TransportError`] when the whole batch was rejected.
    fn upsert_batch(
        &self,
        table: &str,
        key_column: &str,
        rows: &[Row],
        exclude_columns: &[String],
    ) -> Result<UpsertOutcome, TransportError>;

    /// Count live rows. The default pages through the table.
    ///
    /// # Errors
    /// Propagates page fetch failures.
    fn count_rows(&self, table: &str) -> Result<u64, TransportError> {
        let mut offset = 0;
        let mut total = 0_u64;
        loop {
            let page = self.fetch_page(table, offset, DEFAULT_PAGE_SIZE)?;
            total += page.rows.len() as u64;
            match page.next {
                Some(next) => offset = next,
                None => return Ok(total),
            }
        }
    }

    /// Delete rows whose `key_column` matches one of `keys`.
    ///
    /// # Errors
    /// The default implementation reports deletion as unsupported.
    fn delete_rows(&self, table: &str, key_column: &str, keys: &[Value]) -> Result<usize, TransportError> {
        let _ = (key_column, keys);
        Err(TransportError::fatal(format!("transport cannot delete rows from `{table}`")))
    }

    /// Names of the tables the source exposes.
    ///
    /// # Errors
    /// The default implementation reports discovery as unsupported.
    fn list_tables(&self) -> Result<Vec<String>, TransportError> {
        Err(TransportError::fatal("transport cannot list tables"))
    }
}
