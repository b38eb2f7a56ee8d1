use std::collections::BTreeMap;
use std::sync::Arc;

use tablevault_core::{
    classify, content_hash, key_delta, Classification, PriorState, Row, Snapshot, SnapshotId,
    SnapshotKind, SnapshotSummary, TableEntry, TableTransport, VaultError,
};
use tablevault_store::{ChainResolver, PinGuard, ResolvedTable, SnapshotStore};
use time::OffsetDateTime;

use crate::config::VaultConfig;
use crate::pool::{run_pool, with_retry, CancelHandle, TaskResult};

pub(crate) struct CapturePlan<'a> {
    pub store: &'a SnapshotStore,
    pub transport: &'a dyn TableTransport,
    pub config: &'a VaultConfig,
    pub tables: &'a [String],
    pub workers: usize,
    pub force_full: bool,
    pub protects_restore_of: Option<SnapshotId>,
    pub cancel: &'a CancelHandle,
}

/// Read every page of `table`, retrying retryable failures per page.
pub(crate) fn fetch_all(
    transport: &dyn TableTransport,
    config: &VaultConfig,
    cancel: &CancelHandle,
    table: &str,
) -> Result<Vec<Row>, VaultError> {
    let mut rows = Vec::new();
    let mut offset = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        let label = format!("fetch {table}@{offset}");
        let page = with_retry(&config.retry, cancel, &label, || transport.fetch_page(table, offset, config.page_size))?;
        rows.extend(page.rows);
        match page.next {
            Some(next) => offset = next,
            None => return Ok(rows),
        }
    }
}

struct Prior {
    state: PriorState,
    resolved: Option<ResolvedTable>,
}

/// An unpublished snapshot. Snapshots it references stay out of retention
/// until this is dropped, so publish before dropping.
pub(crate) struct Collected {
    pub snapshot: Snapshot,
    _pins: PinGuard,
}

impl Collected {
    /// Write the snapshot and release the pins. From here on the published
    /// snapshot's own references keep its payload holders alive.
    pub fn publish(self, store: &SnapshotStore) -> Result<(Snapshot, SnapshotSummary), VaultError> {
        let summary = store.write(&self.snapshot)?;
        Ok((self.snapshot, summary))
    }
}

/// Fetch every table and assemble an unwritten snapshot.
///
/// Tables whose fetch fails become failed entries; the snapshot is still
/// returned so the caller decides whether to publish it.
pub(crate) fn collect_snapshot(plan: &CapturePlan<'_>) -> Result<Collected, VaultError> {
    let previous = if plan.force_full { None } else { load_previous(plan.store)? };

    let mut resolver = ChainResolver::new(plan.store);
    let mut tasks: Vec<(String, Prior)> = plan
        .tables
        .iter()
        .map(|table| {
            let (state, resolved) = match previous.as_ref() {
                Some(previous) if previous.tables.contains_key(table) => match resolver.resolve(previous, table) {
                    Ok(resolved) => (
                        PriorState::Resolved {
                            materialized_in: resolved.materialized_in,
                            content_hash: resolved.content_hash.clone(),
                        },
                        Some(resolved),
                    ),
                    Err(err) => (PriorState::Unresolved { reason: err.to_string() }, None),
                },
                other => (resolver.prior_state(other, table), None),
            };
            (table.clone(), Prior { state, resolved })
        })
        .collect();

    let pins = pin_holders(plan.store, &mut tasks)?;
    let id = plan.store.next_id()?;
    let outcomes = run_pool(plan.workers, tasks, plan.cancel, |table, prior| capture_table(plan, table, &prior));

    let mut tables = BTreeMap::new();
    for outcome in outcomes {
        let entry = match outcome.result {
            TaskResult::Completed(entry) => entry,
            TaskResult::Panicked(message) => TableEntry::Failed { error: format!("task panicked: {message}") },
            TaskResult::Skipped => TableEntry::Failed { error: VaultError::Cancelled.to_string() },
        };
        tables.insert(outcome.key, entry);
    }

    let kind = if previous.is_some() { SnapshotKind::Incremental } else { SnapshotKind::Full };
    let snapshot = Snapshot {
        id,
        kind,
        created_at: OffsetDateTime::now_utc(),
        previous_snapshot_id: previous.map(|snapshot| snapshot.id),
        protects_restore_of: plan.protects_restore_of,
        tables,
    };
    Ok(Collected { snapshot, _pins: pins })
}

/// Pin every snapshot a table may be deferred to, then drop priors whose
/// holder was deleted before the pin took hold.
fn pin_holders(store: &SnapshotStore, tasks: &mut [(String, Prior)]) -> Result<PinGuard, VaultError> {
    let holders = tasks.iter().filter_map(|(_, prior)| match prior.state {
        PriorState::Resolved { materialized_in, .. } => Some(materialized_in),
        _ => None,
    });
    let pins = store.pin(holders)?;
    for (table, prior) in tasks.iter_mut() {
        if let PriorState::Resolved { materialized_in, .. } = prior.state {
            if !store.contains(materialized_in) {
                tracing::warn!(table = %table, holder = %materialized_in, "previous payload removed by retention");
                prior.state = PriorState::Unresolved { reason: format!("snapshot {materialized_in} was removed") };
                prior.resolved = None;
            }
        }
    }
    Ok(pins)
}

fn load_previous(store: &SnapshotStore) -> Result<Option<Arc<Snapshot>>, VaultError> {
    let Some(latest) = store.latest_id()? else {
        return Ok(None);
    };
    match store.read(latest) {
        Ok(snapshot) => Ok(Some(Arc::new(snapshot))),
        Err(err) => {
            tracing::warn!(snapshot_id = %latest, error = %err, "latest snapshot unreadable; taking a full backup");
            Ok(None)
        }
    }
}

fn capture_table(plan: &CapturePlan<'_>, table: &str, prior: &Prior) -> TableEntry {
    let rows = match fetch_all(plan.transport, plan.config, plan.cancel, table) {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!(table, error = %err, "table fetch failed");
            return TableEntry::Failed { error: err.to_string() };
        }
    };

    let key = plan.config.key_for(table);
    let hash = content_hash(&rows, Some(key));
    let classification = if plan.force_full { Classification::Changed } else { classify(&hash, &prior.state) };

    match classification {
        Classification::Unchanged { reference } => {
            tracing::info!(table, rows = rows.len(), reference = %reference, "table unchanged");
            TableEntry::Deferred { reference_snapshot_id: reference, content_hash: Some(hash) }
        }
        Classification::Unknown => {
            match &prior.state {
                PriorState::Unresolved { reason } => {
                    tracing::warn!(table, reason = %reason, "previous entry unresolved; storing rows");
                }
                _ => tracing::info!(table, rows = rows.len(), "table captured"),
            }
            TableEntry::Materialized { rows, content_hash: hash }
        }
        Classification::Changed => {
            match &prior.resolved {
                Some(resolved) => {
                    let delta = key_delta(&rows, resolved.rows(), key);
                    tracing::info!(table, rows = rows.len(), added = delta.added, removed = delta.removed, "table changed");
                }
                None => tracing::info!(table, rows = rows.len(), "table captured"),
            }
            TableEntry::Materialized { rows, content_hash: hash }
        }
    }
}
