use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tablevault_core::{
    ChainFault, ContentHash, PrimaryKeys, PriorState, Row, Snapshot, SnapshotDocument, SnapshotHeader,
    SnapshotId, SnapshotMetadata, SnapshotSummary, TableEntry, VaultError, MAX_CHAIN_HOPS,
};
use ulid::Ulid;

pub mod journal;

pub use journal::Journal;

pub const SNAPSHOT_PREFIX: &str = "snapshot";
pub const SAFETY_PREFIX: &str = "safety";
pub const SNAPSHOT_AREA: &str = "snapshots";
pub const SAFETY_AREA: &str = "safety";

const JSON_EXT: &str = ".json";
const GZIP_EXT: &str = ".json.gz";
const TEMP_MARKER: &str = ".tmp-";

/// Durable, append-mostly directory of snapshot artifacts.
///
/// All mutations of one area serialize on a lock shared by every store opened
/// on the same directory in this process, so concurrent writers never observe
/// each other's partial files and retention never runs during a publish.
#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    prefix: String,
    compress: bool,
    keys: PrimaryKeys,
    area: Arc<Mutex<AreaState>>,
}

#[derive(Debug, Default)]
struct AreaState {
    last_issued: Option<SnapshotId>,
    /// Snapshots that unpublished captures will reference, with holder counts.
    pending: BTreeMap<SnapshotId, usize>,
}

fn area_state(root: &Path) -> Arc<Mutex<AreaState>> {
    static AREAS: OnceLock<Mutex<BTreeMap<PathBuf, Arc<Mutex<AreaState>>>>> = OnceLock::new();
    let mut areas = AREAS.get_or_init(Mutex::default).lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(areas.entry(root.to_path_buf()).or_default())
}

/// Keeps snapshots out of retention until dropped.
#[derive(Debug)]
pub struct PinGuard {
    area: Arc<Mutex<AreaState>>,
    ids: Vec<SnapshotId>,
}

impl PinGuard {
    #[must_use]
    pub fn ids(&self) -> &[SnapshotId] {
        &self.ids
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut state = self.area.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            if let Some(count) = state.pending.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    state.pending.remove(id);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: Vec<SnapshotId>,
    /// Snapshots past the limit kept because a retained snapshot references them.
    pub pinned: Vec<SnapshotId>,
    /// Artifacts whose metadata could not be read; never deleted automatically.
    pub unreadable: Vec<SnapshotId>,
    pub remaining: usize,
}

impl SnapshotStore {
    /// Open (creating if needed) the artifact area at `root`.
    ///
    /// Leftover temporary files from interrupted writes are removed.
    ///
    /// # Errors
    /// Returns [`VaultError::Io`] when the directory cannot be created or scanned.
    pub fn open(root: &Path, prefix: &str, compress: bool) -> Result<Self, VaultError> {
        fs::create_dir_all(root)
            .map_err(|err| VaultError::Io(format!("failed to create {}: {err}", root.display())))?;

        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

        let store = Self {
            area: area_state(&root),
            root,
            prefix: prefix.to_string(),
            compress,
            keys: PrimaryKeys::default(),
        };
        let mut state = store.lock()?;
        store.remove_stale_temp_files()?;
        let latest = store.list_ids()?.last().copied();
        if latest > state.last_issued {
            state.last_issued = latest;
        }
        drop(state);
        Ok(store)
    }

    /// Key columns used when an artifact's payload hash must be recomputed.
    #[must_use]
    pub fn with_primary_keys(mut self, keys: PrimaryKeys) -> Self {
        self.keys = keys;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn compresses(&self) -> bool {
        self.compress
    }

    fn lock(&self) -> Result<MutexGuard<'_, AreaState>, VaultError> {
        self.area.lock().map_err(|_| VaultError::Io("snapshot store lock poisoned".to_string()))
    }

    /// Issue an id greater than every id this area has seen.
    ///
    /// # Errors
    /// Returns [`VaultError::Io`] when the store lock is poisoned.
    pub fn next_id(&self) -> Result<SnapshotId, VaultError> {
        let mut state = self.lock()?;
        let id = SnapshotId::next_after(state.last_issued);
        state.last_issued = Some(id);
        Ok(id)
    }

    /// Protect `ids` from retention while a capture that references them is
    /// still unpublished. Pinning a deleted id has no effect; callers check
    /// [`SnapshotStore::contains`] afterwards.
    ///
    /// # Errors
    /// Returns [`VaultError::Io`] when the store lock is poisoned.
    pub fn pin(&self, ids: impl IntoIterator<Item = SnapshotId>) -> Result<PinGuard, VaultError> {
        let ids: Vec<SnapshotId> = ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let mut state = self.lock()?;
        for id in &ids {
            *state.pending.entry(*id).or_default() += 1;
        }
        drop(state);
        Ok(PinGuard { area: Arc::clone(&self.area), ids })
    }

    #[must_use]
    pub fn contains(&self, id: SnapshotId) -> bool {
        self.locate(id).is_some()
    }

    fn file_name(&self, id: SnapshotId, compressed: bool) -> String {
        let ext = if compressed { GZIP_EXT } else { JSON_EXT };
        format!("{}_{id}{ext}", self.prefix)
    }

    fn locate(&self, id: SnapshotId) -> Option<PathBuf> {
        [true, false]
            .into_iter()
            .map(|compressed| self.root.join(self.file_name(id, compressed)))
            .find(|path| path.exists())
    }

    /// Persist a snapshot atomically: temp file, fsync, rename.
    ///
    /// # Errors
    /// Returns [`VaultError::Io`] on filesystem failure or when an artifact with
    /// the same id already exists.
    pub fn write(&self, snapshot: &Snapshot) -> Result<SnapshotSummary, VaultError> {
        let document = snapshot.to_document();
        let json = serde_json::to_vec(&document)
            .map_err(|err| VaultError::Io(format!("failed to serialize snapshot {}: {err}", snapshot.id)))?;
        let bytes = if self.compress { gzip(&json)? } else { json };

        let mut state = self.lock()?;
        if self.locate(snapshot.id).is_some() {
            return Err(VaultError::Io(format!("snapshot {} already exists", snapshot.id)));
        }

        let file_name = self.file_name(snapshot.id, self.compress);
        let final_path = self.root.join(&file_name);
        let temp_path = self.root.join(format!(".{file_name}{TEMP_MARKER}{}", Ulid::new()));

        let written = write_synced(&temp_path, &bytes).and_then(|()| {
            fs::rename(&temp_path, &final_path).map_err(|err| {
                VaultError::Io(format!("failed to move snapshot into {}: {err}", final_path.display()))
            })
        });
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
        if let Ok(dir) = File::open(&self.root) {
            let _ = dir.sync_all();
        }

        if state.last_issued.map_or(true, |issued| issued < snapshot.id) {
            state.last_issued = Some(snapshot.id);
        }
        drop(state);

        tracing::debug!(snapshot_id = %snapshot.id, path = %final_path.display(), bytes = bytes.len(), "snapshot written");
        Ok(SnapshotSummary::from_metadata(&snapshot.metadata(), file_name, bytes.len() as u64))
    }

    /// Load and structurally validate a full snapshot.
    ///
    /// # Errors
    /// Returns [`VaultError::NotFound`] when no artifact exists for `id` and
    /// [`VaultError::Corrupt`] when it cannot be decoded or violates invariants.
    pub fn read(&self, id: SnapshotId) -> Result<Snapshot, VaultError> {
        let path = self.locate(id).ok_or(VaultError::NotFound(id))?;
        let artifact = path.display().to_string();
        let json = read_artifact(&path)?;
        let document: SnapshotDocument =
            serde_json::from_slice(&json).map_err(|err| VaultError::corrupt(&artifact, err.to_string()))?;
        if document.metadata.id != id {
            return Err(VaultError::corrupt(
                &artifact,
                format!("metadata id {} does not match file id {id}", document.metadata.id),
            ));
        }
        Snapshot::from_document(document, &artifact, &self.keys)
    }

    /// Load only the metadata block.
    ///
    /// # Errors
    /// Same as [`SnapshotStore::read`].
    pub fn read_metadata(&self, id: SnapshotId) -> Result<SnapshotMetadata, VaultError> {
        let path = self.locate(id).ok_or(VaultError::NotFound(id))?;
        let artifact = path.display().to_string();
        let json = read_artifact(&path)?;
        let header: SnapshotHeader =
            serde_json::from_slice(&json).map_err(|err| VaultError::corrupt(&artifact, err.to_string()))?;
        if header.metadata.id != id {
            return Err(VaultError::corrupt(&artifact, "metadata id does not match file name"));
        }
        Ok(header.metadata)
    }

    /// Snapshot ids present in the area, oldest first.
    ///
    /// # Errors
    /// Returns [`VaultError::Io`] when the directory cannot be read.
    pub fn list_ids(&self) -> Result<Vec<SnapshotId>, VaultError> {
        let mut ids: Vec<SnapshotId> = self.scan()?.into_keys().collect();
        ids.sort();
        Ok(ids)
    }

    /// Newest id present in the area.
    ///
    /// # Errors
    /// Returns [`VaultError::Io`] when the directory cannot be read.
    pub fn latest_id(&self) -> Result<Option<SnapshotId>, VaultError> {
        Ok(self.list_ids()?.last().copied())
    }

    /// Summaries for every readable artifact, newest first. Unreadable
    /// artifacts are logged and skipped.
    ///
    /// # Errors
    /// Returns [`VaultError::Io`] when the directory cannot be read.
    pub fn list(&self) -> Result<Vec<SnapshotSummary>, VaultError> {
        let mut summaries = Vec::new();
        for (id, path) in self.scan()? {
            let size = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
            let file_name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
            match self.read_metadata(id) {
                Ok(metadata) => summaries.push(SnapshotSummary::from_metadata(&metadata, file_name, size)),
                Err(err) => tracing::warn!(snapshot_id = %id, error = %err, "skipping unreadable snapshot"),
            }
        }
        summaries.sort_by(|left, right| right.id.cmp(&left.id));
        Ok(summaries)
    }

    /// Remove an artifact.
    ///
    /// # Errors
    /// Returns [`VaultError::NotFound`] or [`VaultError::Io`].
    pub fn delete(&self, id: SnapshotId) -> Result<(), VaultError> {
        let _guard = self.lock()?;
        self.delete_unlocked(id)
    }

    fn delete_unlocked(&self, id: SnapshotId) -> Result<(), VaultError> {
        let path = self.locate(id).ok_or(VaultError::NotFound(id))?;
        fs::remove_file(&path)
            .map_err(|err| VaultError::Io(format!("failed to delete {}: {err}", path.display())))
    }

    /// Delete old snapshots until at most `limit` remain, never deleting one
    /// that a retained snapshot or a pinned capture still references.
    ///
    /// Candidates are taken oldest first from every artifact but the newest.
    /// A referenced candidate is skipped in favour of the next-oldest, and the
    /// reference graph is re-evaluated after each deletion.
    ///
    /// # Errors
    /// Returns [`VaultError::Io`] when scanning or deletion fails.
    pub fn enforce_retention(&self, limit: usize) -> Result<RetentionReport, VaultError> {
        let guard = self.lock()?;
        let mut report = RetentionReport::default();

        let mut live: Vec<(SnapshotId, Option<BTreeSet<SnapshotId>>)> = Vec::new();
        let mut ids: Vec<SnapshotId> = self.scan()?.into_keys().collect();
        ids.sort();
        for id in ids {
            match self.read_metadata(id) {
                Ok(metadata) => live.push((id, Some(metadata.referenced_snapshots.into_iter().collect()))),
                Err(err) => {
                    tracing::warn!(snapshot_id = %id, error = %err, "retention cannot read snapshot metadata");
                    report.unreadable.push(id);
                    live.push((id, None));
                }
            }
        }

        let mut pinned = BTreeSet::new();
        while live.len() > limit {
            let mut referenced: BTreeSet<SnapshotId> = live
                .iter()
                .filter_map(|(id, refs)| refs.as_ref().map(|refs| (id, refs)))
                .flat_map(|(id, refs)| refs.iter().filter(move |target| *target != id).copied())
                .collect();
            referenced.extend(guard.pending.keys().copied());

            let window = live.len() - usize::from(limit > 0);
            let candidate = live[..window].iter().position(|(id, refs)| refs.is_some() && !referenced.contains(id));
            let scanned = candidate.unwrap_or(window);
            pinned.extend(live[..scanned].iter().map(|(id, _)| *id).filter(|id| referenced.contains(id)));
            let Some(idx) = candidate else {
                break;
            };

            let (id, _) = live.remove(idx);
            self.delete_unlocked(id)?;
            tracing::info!(snapshot_id = %id, area = %self.prefix, "retention deleted snapshot");
            report.deleted.push(id);
        }

        report.pinned = live.iter().map(|(id, _)| *id).filter(|id| pinned.contains(id)).collect();
        report.remaining = live.len();
        Ok(report)
    }

    fn scan(&self) -> Result<BTreeMap<SnapshotId, PathBuf>, VaultError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|err| VaultError::Io(format!("failed to read {}: {err}", self.root.display())))?;
        let mut found = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|err| VaultError::Io(err.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = parse_artifact_name(&self.prefix, &name) {
                found.insert(id, entry.path());
            }
        }
        Ok(found)
    }

    fn remove_stale_temp_files(&self) -> Result<(), VaultError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|err| VaultError::Io(format!("failed to read {}: {err}", self.root.display())))?;
        let marker = format!(".{}_", self.prefix);
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&marker) && name.contains(TEMP_MARKER) {
                tracing::warn!(file = %name, "removing interrupted snapshot write");
                fs::remove_file(entry.path()).map_err(|err| VaultError::Io(err.to_string()))?;
            }
        }
        Ok(())
    }
}

fn parse_artifact_name(prefix: &str, name: &str) -> Option<SnapshotId> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    let stem = rest.strip_suffix(GZIP_EXT).or_else(|| rest.strip_suffix(JSON_EXT))?;
    Ulid::from_string(stem).ok().map(SnapshotId)
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, VaultError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
    let mut file = File::create(path)
        .map_err(|err| VaultError::Io(format!("failed to create {}: {err}", path.display())))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|err| VaultError::Io(format!("failed to write {}: {err}", path.display())))
}

fn read_artifact(path: &Path) -> Result<Vec<u8>, VaultError> {
    let raw = fs::read(path).map_err(|err| VaultError::Io(format!("failed to read {}: {err}", path.display())))?;
    if !path.to_string_lossy().ends_with(GZIP_EXT) {
        return Ok(raw);
    }
    let mut decoded = Vec::new();
    GzDecoder::new(raw.as_slice())
        .read_to_end(&mut decoded)
        .map_err(|err| VaultError::corrupt(path.display().to_string(), format!("gzip decode failed: {err}")))?;
    Ok(decoded)
}

/// Rows of one table after following back-references to their physical home.
#[derive(Debug, Clone)]
pub struct ResolvedTable {
    pub table: String,
    pub materialized_in: SnapshotId,
    pub content_hash: ContentHash,
    /// Snapshot ids visited, starting with the one resolution began from.
    pub chain: Vec<SnapshotId>,
    holder: Arc<Snapshot>,
}

impl ResolvedTable {
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        match self.holder.tables.get(&self.table) {
            Some(TableEntry::Materialized { rows, .. }) => rows,
            _ => &[],
        }
    }

    #[must_use]
    pub fn hops(&self) -> usize {
        self.chain.len().saturating_sub(1)
    }
}

/// Follows back-references with a hop bound, caching every snapshot it loads.
///
/// Resolution fails closed: a cycle, a missing target, a missing table or a
/// failed entry is an error, never an empty table.
pub struct ChainResolver<'a> {
    store: &'a SnapshotStore,
    max_hops: usize,
    cache: BTreeMap<SnapshotId, Result<Arc<Snapshot>, VaultError>>,
}

impl<'a> ChainResolver<'a> {
    #[must_use]
    pub fn new(store: &'a SnapshotStore) -> Self {
        Self::with_max_hops(store, MAX_CHAIN_HOPS)
    }

    #[must_use]
    pub fn with_max_hops(store: &'a SnapshotStore, max_hops: usize) -> Self {
        Self { store, max_hops, cache: BTreeMap::new() }
    }

    /// Load a snapshot through the cache.
    ///
    /// # Errors
    /// Returns the store's [`VaultError::NotFound`] or [`VaultError::Corrupt`].
    pub fn load(&mut self, id: SnapshotId) -> Result<Arc<Snapshot>, VaultError> {
        let store = self.store;
        self.cache.entry(id).or_insert_with(|| store.read(id).map(Arc::new)).clone()
    }

    /// Resolve `table` starting from the stored snapshot `id`.
    ///
    /// # Errors
    /// See [`ChainResolver::resolve`].
    pub fn resolve_id(&mut self, id: SnapshotId, table: &str) -> Result<ResolvedTable, VaultError> {
        let start = self.load(id)?;
        self.resolve(&start, table)
    }

    /// Resolve `table` starting from `start`.
    ///
    /// # Errors
    /// Returns [`VaultError::ChainResolution`] carrying the visited chain.
    pub fn resolve(&mut self, start: &Arc<Snapshot>, table: &str) -> Result<ResolvedTable, VaultError> {
        let mut chain = vec![start.id];
        let mut visited = BTreeSet::from([start.id]);
        let mut current = Arc::clone(start);

        loop {
            let fail = |chain: Vec<SnapshotId>, fault: ChainFault| VaultError::ChainResolution {
                table: table.to_string(),
                chain,
                fault,
            };
            let next = match current.tables.get(table) {
                None => return Err(fail(chain, ChainFault::MissingTable { snapshot: current.id })),
                Some(TableEntry::Failed { .. }) => {
                    return Err(fail(chain, ChainFault::FailedEntry { snapshot: current.id }));
                }
                Some(TableEntry::Materialized { content_hash, .. }) => {
                    let content_hash = content_hash.clone();
                    let materialized_in = current.id;
                    return Ok(ResolvedTable {
                        table: table.to_string(),
                        materialized_in,
                        content_hash,
                        chain,
                        holder: current,
                    });
                }
                Some(TableEntry::Deferred { reference_snapshot_id, .. }) => *reference_snapshot_id,
            };

            if chain.len() > self.max_hops {
                return Err(fail(chain, ChainFault::TooManyHops { limit: self.max_hops }));
            }
            if !visited.insert(next) {
                chain.push(next);
                return Err(fail(chain, ChainFault::Cycle { revisited: next }));
            }
            chain.push(next);
            current = match self.load(next) {
                Ok(snapshot) => snapshot,
                Err(VaultError::NotFound(missing)) => {
                    return Err(fail(chain, ChainFault::DanglingReference { missing }));
                }
                Err(err) => {
                    return Err(fail(chain, ChainFault::CorruptLink { snapshot: next, reason: err.to_string() }));
                }
            };
        }
    }

    /// What `previous` knows about `table`, for change detection.
    pub fn prior_state(&mut self, previous: Option<&Arc<Snapshot>>, table: &str) -> PriorState {
        let Some(previous) = previous else {
            return PriorState::NoPreviousSnapshot;
        };
        if !previous.tables.contains_key(table) {
            return PriorState::Absent;
        }
        match self.resolve(previous, table) {
            Ok(resolved) => PriorState::Resolved {
                materialized_in: resolved.materialized_in,
                content_hash: resolved.content_hash,
            },
            Err(err) => PriorState::Unresolved { reason: err.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use anyhow::{anyhow, Result};
    use serde_json::{json, Value};
    use tablevault_core::{SnapshotKind, DEFAULT_RETENTION_LIMIT};
    use time::OffsetDateTime;

    use super::*;

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tablevault-store-{label}-{}", Ulid::new()))
    }

    fn rows(count: i64) -> Vec<Row> {
        (1..=count)
            .filter_map(|id| match json!({"id": id, "name": format!("row-{id}")}) {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()
    }

    fn full(id: SnapshotId, tables: &[(&str, i64)]) -> Snapshot {
        Snapshot {
            id,
            kind: SnapshotKind::Full,
            created_at: OffsetDateTime::now_utc(),
            previous_snapshot_id: None,
            protects_restore_of: None,
            tables: tables
                .iter()
                .map(|(name, count)| ((*name).to_string(), TableEntry::materialized(rows(*count), Some("id"))))
                .collect(),
        }
    }

    fn deferring(id: SnapshotId, previous: SnapshotId, table: &str, target: SnapshotId) -> Snapshot {
        let mut tables = BTreeMap::new();
        tables.insert(
            table.to_string(),
            TableEntry::Deferred { reference_snapshot_id: target, content_hash: None },
        );
        Snapshot {
            id,
            kind: SnapshotKind::Incremental,
            created_at: OffsetDateTime::now_utc(),
            previous_snapshot_id: Some(previous),
            protects_restore_of: None,
            tables,
        }
    }

    // Test IDs: STORE-001
    #[test]
    fn write_then_read_compressed_and_plain() -> Result<()> {
        for compress in [true, false] {
            let root = temp_root("rw");
            let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, compress)?;
            let snapshot = full(store.next_id()?, &[("users", 10), ("orders", 5)]);
            let summary = store.write(&snapshot)?;

            assert_eq!(summary.file_name.ends_with(".gz"), compress);
            assert_eq!(summary.total_rows, 15);
            let loaded = store.read(snapshot.id)?;
            assert_eq!(loaded.tables, snapshot.tables);
            assert_eq!(store.read_metadata(snapshot.id)?.total_tables, 2);
            let _ = fs::remove_dir_all(&root);
        }
        Ok(())
    }

    #[test]
    fn missing_snapshot_is_not_found() -> Result<()> {
        let root = temp_root("missing");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, true)?;
        let id = SnapshotId::new();
        assert_eq!(store.read(id).err(), Some(VaultError::NotFound(id)));
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    // Test IDs: STORE-002
    #[test]
    fn damaged_artifacts_are_corrupt() -> Result<()> {
        let root = temp_root("corrupt");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, true)?;
        let gz_id = SnapshotId::new();
        fs::write(root.join(format!("snapshot_{gz_id}.json.gz")), b"not gzip at all")?;
        let json_id = SnapshotId::next_after(Some(gz_id));
        fs::write(root.join(format!("snapshot_{json_id}.json")), b"{\"metadata\": {")?;

        assert!(matches!(store.read(gz_id), Err(VaultError::Corrupt { .. })));
        assert!(matches!(store.read(json_id), Err(VaultError::Corrupt { .. })));
        assert!(store.list()?.is_empty());
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn misnamed_artifact_is_corrupt() -> Result<()> {
        let root = temp_root("misnamed");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let snapshot = full(store.next_id()?, &[("users", 1)]);
        let summary = store.write(&snapshot)?;
        let other = SnapshotId::next_after(Some(snapshot.id));
        fs::rename(root.join(&summary.file_name), root.join(format!("snapshot_{other}.json")))?;
        assert!(matches!(store.read(other), Err(VaultError::Corrupt { .. })));
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn open_removes_interrupted_writes() -> Result<()> {
        let root = temp_root("tmp");
        fs::create_dir_all(&root)?;
        let stale = root.join(format!(".snapshot_{}.json.gz.tmp-{}", SnapshotId::new(), Ulid::new()));
        fs::write(&stale, b"partial")?;
        let unrelated = root.join("notes.txt");
        fs::write(&unrelated, b"keep")?;

        let _store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, true)?;
        assert!(!stale.exists());
        assert!(unrelated.exists());
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn duplicate_id_is_rejected() -> Result<()> {
        let root = temp_root("dup");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, true)?;
        let snapshot = full(store.next_id()?, &[("users", 1)]);
        store.write(&snapshot)?;
        assert!(matches!(store.write(&snapshot), Err(VaultError::Io(_))));
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn list_is_newest_first_and_areas_are_separate() -> Result<()> {
        let root = temp_root("list");
        let snapshots = SnapshotStore::open(&root.join(SNAPSHOT_AREA), SNAPSHOT_PREFIX, true)?;
        let safety = SnapshotStore::open(&root.join(SAFETY_AREA), SAFETY_PREFIX, true)?;
        let mut written = Vec::new();
        for _ in 0..3 {
            let snapshot = full(snapshots.next_id()?, &[("users", 2)]);
            snapshots.write(&snapshot)?;
            written.push(snapshot.id);
        }
        safety.write(&full(safety.next_id()?, &[("users", 2)]))?;

        let listed: Vec<SnapshotId> = snapshots.list()?.into_iter().map(|summary| summary.id).collect();
        written.reverse();
        assert_eq!(listed, written);
        assert_eq!(safety.list()?.len(), 1);
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    // Test IDs: RET-001
    #[test]
    fn retention_keeps_newest_limit() -> Result<()> {
        let root = temp_root("retention");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let mut ids = Vec::new();
        for _ in 0..300 {
            let snapshot = full(store.next_id()?, &[("t", 1)]);
            store.write(&snapshot)?;
            ids.push(snapshot.id);
        }

        let report = store.enforce_retention(DEFAULT_RETENTION_LIMIT)?;
        assert_eq!(report.deleted, ids[..12].to_vec());
        assert_eq!(report.remaining, DEFAULT_RETENTION_LIMIT);
        assert_eq!(store.list_ids()?, ids[12..].to_vec());
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    // Test IDs: RET-002
    #[test]
    fn retention_never_orphans_references() -> Result<()> {
        let root = temp_root("retention-deps");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let base = full(store.next_id()?, &[("users", 3)]);
        store.write(&base)?;
        let mut previous = base.id;
        for _ in 0..4 {
            let id = store.next_id()?;
            store.write(&deferring(id, previous, "users", base.id))?;
            previous = id;
        }

        let report = store.enforce_retention(2)?;
        assert!(report.deleted.iter().all(|id| *id != base.id));
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(report.pinned, vec![base.id]);
        assert_eq!(report.remaining, 2);

        let mut resolver = ChainResolver::new(&store);
        for id in store.list_ids()? {
            assert_eq!(resolver.resolve_id(id, "users")?.materialized_in, base.id);
        }
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn retention_releases_base_once_unreferenced() -> Result<()> {
        let root = temp_root("retention-release");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let base = full(store.next_id()?, &[("users", 3)]);
        store.write(&base)?;
        let dependent = deferring(store.next_id()?, base.id, "users", base.id);
        store.write(&dependent)?;
        for _ in 0..2 {
            store.write(&full(store.next_id()?, &[("users", 4)]))?;
        }

        let report = store.enforce_retention(2)?;
        assert_eq!(report.deleted, vec![dependent.id, base.id]);
        assert_eq!(report.remaining, 2);
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn pinned_reference_survives_retention_from_another_handle() -> Result<()> {
        let root = temp_root("retention-pending");
        let capturing = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let cleaning = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let base = full(capturing.next_id()?, &[("users", 3)]);
        capturing.write(&base)?;
        cleaning.write(&full(cleaning.next_id()?, &[("orders", 1)]))?;

        let pins = capturing.pin([base.id])?;
        let report = cleaning.enforce_retention(1)?;
        assert!(report.deleted.is_empty());
        assert_eq!(report.pinned, vec![base.id]);

        let dependent = deferring(capturing.next_id()?, base.id, "users", base.id);
        capturing.write(&dependent)?;
        drop(pins);

        let report = cleaning.enforce_retention(1)?;
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.pinned, vec![base.id]);
        assert_eq!(ChainResolver::new(&cleaning).resolve_id(dependent.id, "users")?.materialized_in, base.id);
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn handles_on_one_area_share_id_sequence() -> Result<()> {
        let root = temp_root("shared-ids");
        let first = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let second = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let mut issued = Vec::new();
        for _ in 0..20 {
            issued.push(first.next_id()?);
            issued.push(second.next_id()?);
        }
        assert!(issued.windows(2).all(|pair| pair[0] < pair[1]));
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn retention_during_concurrent_publishes_keeps_chains_whole() -> Result<()> {
        let root = temp_root("retention-race");
        let writer = Arc::new(SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?);
        let cleaner = Arc::new(SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?);
        let base = full(writer.next_id()?, &[("users", 3)]);
        writer.write(&base)?;

        let publishing = {
            let writer = Arc::clone(&writer);
            thread::spawn(move || -> Result<()> {
                for round in 0..20 {
                    let _pins = writer.pin([base.id])?;
                    if round % 2 == 0 {
                        writer.write(&full(writer.next_id()?, &[("users", 1)]))?;
                    }
                    let id = writer.next_id()?;
                    writer.write(&deferring(id, base.id, "users", base.id))?;
                }
                Ok(())
            })
        };
        let cleaning = {
            let cleaner = Arc::clone(&cleaner);
            thread::spawn(move || -> Result<()> {
                for _ in 0..20 {
                    cleaner.enforce_retention(1)?;
                }
                Ok(())
            })
        };
        for handle in [publishing, cleaning] {
            let Ok(result) = handle.join() else {
                return Err(anyhow!("worker thread panicked"));
            };
            result?;
        }

        let mut resolver = ChainResolver::new(&cleaner);
        for id in cleaner.list_ids()? {
            resolver.resolve_id(id, "users")?;
        }
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    // Test IDs: CHAIN-001
    #[test]
    fn resolution_reports_dangling_reference() -> Result<()> {
        let root = temp_root("dangling");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let ghost = store.next_id()?;
        let id = store.next_id()?;
        store.write(&deferring(id, ghost, "users", ghost))?;

        let mut resolver = ChainResolver::new(&store);
        let Err(VaultError::ChainResolution { chain, fault, .. }) = resolver.resolve_id(id, "users") else {
            return Err(anyhow!("dangling reference must fail resolution"));
        };
        assert_eq!(chain, vec![id, ghost]);
        assert_eq!(fault, ChainFault::DanglingReference { missing: ghost });
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    // Test IDs: CHAIN-002
    #[test]
    fn resolution_detects_cycles() -> Result<()> {
        let root = temp_root("cycle");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let first = store.next_id()?;
        let second = store.next_id()?;
        store.write(&deferring(first, second, "users", second))?;
        store.write(&deferring(second, first, "users", first))?;

        let mut resolver = ChainResolver::new(&store);
        let Err(VaultError::ChainResolution { fault, .. }) = resolver.resolve_id(first, "users") else {
            return Err(anyhow!("cycle must fail resolution"));
        };
        assert_eq!(fault, ChainFault::Cycle { revisited: first });
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    // Test IDs: CHAIN-003
    #[test]
    fn resolution_is_bounded() -> Result<()> {
        let root = temp_root("hops");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let base = full(store.next_id()?, &[("users", 1)]);
        store.write(&base)?;
        let mut previous = base.id;
        for _ in 0..5 {
            let id = store.next_id()?;
            store.write(&deferring(id, previous, "users", previous))?;
            previous = id;
        }

        let mut resolver = ChainResolver::with_max_hops(&store, 5);
        assert_eq!(resolver.resolve_id(previous, "users")?.hops(), 5);

        let mut strict = ChainResolver::with_max_hops(&store, 4);
        assert!(matches!(
            strict.resolve_id(previous, "users"),
            Err(VaultError::ChainResolution { fault: ChainFault::TooManyHops { limit: 4 }, .. })
        ));
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn resolution_rejects_missing_and_failed_tables() -> Result<()> {
        let root = temp_root("missing-table");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let mut base = full(store.next_id()?, &[("users", 1)]);
        base.tables.insert("audit".to_string(), TableEntry::Failed { error: "boom".to_string() });
        store.write(&base)?;
        let dependent = deferring(store.next_id()?, base.id, "orders", base.id);
        store.write(&dependent)?;

        let mut resolver = ChainResolver::new(&store);
        assert!(matches!(
            resolver.resolve_id(dependent.id, "orders"),
            Err(VaultError::ChainResolution { fault: ChainFault::MissingTable { .. }, .. })
        ));
        assert!(matches!(
            resolver.resolve_id(base.id, "audit"),
            Err(VaultError::ChainResolution { fault: ChainFault::FailedEntry { .. }, .. })
        ));
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn prior_state_distinguishes_absent_and_unresolved() -> Result<()> {
        let root = temp_root("prior");
        let store = SnapshotStore::open(&root, SNAPSHOT_PREFIX, false)?;
        let ghost = store.next_id()?;
        let dangling = Arc::new(deferring(store.next_id()?, ghost, "users", ghost));
        let base = Arc::new(full(store.next_id()?, &[("orders", 2)]));

        let mut resolver = ChainResolver::new(&store);
        assert_eq!(resolver.prior_state(None, "users"), PriorState::NoPreviousSnapshot);
        assert_eq!(resolver.prior_state(Some(&base), "users"), PriorState::Absent);
        assert!(matches!(resolver.prior_state(Some(&dangling), "users"), PriorState::Unresolved { .. }));
        assert!(matches!(
            resolver.prior_state(Some(&base), "orders"),
            PriorState::Resolved { materialized_in, .. } if materialized_in == base.id
        ));
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_writers_get_distinct_ordered_ids() -> Result<()> {
        let root = temp_root("concurrent");
        let store = Arc::new(SnapshotStore::open(&root, SNAPSHOT_PREFIX, true)?);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || -> Result<Vec<SnapshotId>> {
                let mut ids = Vec::new();
                for _ in 0..10 {
                    let snapshot = full(store.next_id()?, &[("users", 2)]);
                    store.write(&snapshot)?;
                    ids.push(snapshot.id);
                }
                Ok(ids)
            }));
        }

        let mut all = BTreeSet::new();
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("writer thread panicked"));
            };
            all.extend(thread_result?);
        }
        assert_eq!(all.len(), 40);
        assert_eq!(store.list()?.len(), 40);
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }
}
