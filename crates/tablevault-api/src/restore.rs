//! Restore orchestration: safety capture, validation, batched upsert, and
//! count verification, sequenced through the core restore state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tablevault_core::{
    canonical_json, CountMismatch, RestoreDraft, RestoreEvent, RestoreKind, RestoreRecord, Row, Snapshot,
    SnapshotId, TableRestoreResult, TableTransport, UpsertOutcome, VaultError,
};
use tablevault_store::{ChainResolver, ResolvedTable, SnapshotStore};
use time::OffsetDateTime;

use crate::backup::{collect_snapshot, fetch_all, CapturePlan};
use crate::config::VaultConfig;
use crate::pool::{run_pool, with_retry, CancelHandle, TaskResult};

const MAX_ERROR_DETAILS: usize = 5;

pub(crate) struct RestorePlan<'a> {
    pub config: &'a VaultConfig,
    pub transport: &'a dyn TableTransport,
    /// Area holding the target snapshot.
    pub source: &'a SnapshotStore,
    pub safety: &'a SnapshotStore,
    pub kind: RestoreKind,
    pub target: SnapshotId,
    pub safe: bool,
    pub workers: usize,
    pub cancel: &'a CancelHandle,
}

/// A sealed record, plus the error that stopped the run before any write.
pub(crate) struct RestoreRun {
    pub record: RestoreRecord,
    pub abort: Option<VaultError>,
}

/// Drive one restore or rollback to a terminal state.
///
/// # Errors
/// Returns an error only when the state machine rejects a transition, which
/// indicates a sequencing bug, or when a store lock is poisoned.
pub(crate) fn execute(plan: &RestorePlan<'_>) -> Result<RestoreRun, VaultError> {
    let mut draft = RestoreDraft::new(plan.kind, plan.target, OffsetDateTime::now_utc());
    tracing::info!(
        restore_id = %draft.restore_id,
        kind = plan.kind.as_str(),
        target = %plan.target,
        safe = plan.safe,
        "restore started"
    );

    // Retention in the source area must not remove the target or its
    // payload holders while they are being read.
    let _target_pin = plan.source.pin([plan.target])?;
    let mut resolver = ChainResolver::new(plan.source);
    // The capture covers every table the target will write, whatever its
    // metadata lists say.
    let (target, tables, _holder_pins) = match resolver.load(plan.target) {
        Ok(target) => {
            let tables = target.tables.keys().cloned().collect::<Vec<_>>();
            let holders = plan.source.pin(target.referenced_snapshots())?;
            (target, tables, holders)
        }
        Err(err) => {
            draft.apply(RestoreEvent::Begin { safe: false })?;
            draft.validation_defects.push(err.to_string());
            return abort(draft, RestoreEvent::ValidationFailed, err);
        }
    };

    draft.apply(RestoreEvent::Begin { safe: plan.safe })?;
    if plan.safe {
        if let Err(err) = safety_capture(plan, &tables, &mut draft) {
            tracing::error!(restore_id = %draft.restore_id, error = %err, "safety capture failed; live data untouched");
            return abort(draft, RestoreEvent::CaptureFailed, err);
        }
        draft.apply(RestoreEvent::CaptureSaved)?;
    } else {
        record_live_counts(plan, &tables, &mut draft);
    }

    let payloads = match validate(plan, &mut resolver, &target, &mut draft) {
        Ok(payloads) => payloads,
        Err(err) => {
            tracing::error!(restore_id = %draft.restore_id, defects = draft.validation_defects.len(), "validation failed");
            return abort(draft, RestoreEvent::ValidationFailed, err);
        }
    };
    draft.apply(RestoreEvent::Validated)?;

    let expected: BTreeMap<String, usize> =
        payloads.iter().map(|(table, resolved)| (table.clone(), resolved.rows().len())).collect();
    let attempted = payloads.len();
    let mirror = plan.kind == RestoreKind::Rollback;
    let outcomes = run_pool(plan.workers, payloads, plan.cancel, |table, resolved| {
        restore_table(plan, table, resolved.rows(), mirror)
    });
    for outcome in outcomes {
        let result = match outcome.result {
            TaskResult::Completed(result) => result,
            TaskResult::Panicked(message) => TableRestoreResult {
                failed: true,
                failure_reason: Some(format!("task panicked: {message}")),
                ..TableRestoreResult::default()
            },
            TaskResult::Skipped => TableRestoreResult {
                failed: true,
                skipped_rows: expected.get(&outcome.key).copied().unwrap_or_default(),
                failure_reason: Some(VaultError::Cancelled.to_string()),
                ..TableRestoreResult::default()
            },
        };
        if result.failed {
            tracing::warn!(
                table = %outcome.key,
                errors = result.errors,
                reason = result.failure_reason.as_deref().unwrap_or_default(),
                "table restore failed"
            );
        }
        draft.per_table_result.insert(outcome.key, result);
    }

    if plan.cancel.is_cancelled() {
        draft.apply(RestoreEvent::WritesCancelled)?;
        verify_counts(plan, &expected, &mut draft);
    } else {
        draft.apply(RestoreEvent::WritesFinished)?;
        verify_counts(plan, &expected, &mut draft);
        let failed_tables = draft.failed_table_count();
        draft.apply(RestoreEvent::Verified { failed_tables, attempted_tables: attempted, rollback: mirror })?;
    }

    let record = draft.seal(OffsetDateTime::now_utc(), None)?;
    tracing::info!(
        restore_id = %record.restore_id,
        outcome = record.outcome.as_str(),
        failed_tables = record.failed_tables().len(),
        mismatches = record.count_mismatches.len(),
        "restore finished"
    );
    Ok(RestoreRun { record, abort: None })
}

fn abort(mut draft: RestoreDraft, event: RestoreEvent, err: VaultError) -> Result<RestoreRun, VaultError> {
    draft.apply(event)?;
    let record = draft.seal(OffsetDateTime::now_utc(), Some(err.to_string()))?;
    tracing::warn!(restore_id = %record.restore_id, error = %err, "restore aborted before any write");
    Ok(RestoreRun { record, abort: Some(err) })
}

/// Full capture of the live tables about to be overwritten.
fn safety_capture(plan: &RestorePlan<'_>, tables: &[String], draft: &mut RestoreDraft) -> Result<(), VaultError> {
    let capture = collect_snapshot(&CapturePlan {
        store: plan.safety,
        transport: plan.transport,
        config: plan.config,
        tables,
        workers: plan.config.backup_workers,
        force_full: true,
        protects_restore_of: Some(plan.target),
        cancel: plan.cancel,
    })
    .map(|collected| collected.snapshot)
    .map_err(|err| VaultError::SafetyCapture(err.to_string()))?;

    let failed = capture.failed_tables();
    if !failed.is_empty() {
        return Err(VaultError::SafetyCapture(format!("tables could not be captured: {}", failed.join(", "))));
    }
    plan.safety.write(&capture).map_err(|err| VaultError::SafetyCapture(err.to_string()))?;

    draft.safety_capture_id = Some(capture.id);
    draft.before_counts =
        capture.tables.iter().map(|(table, entry)| (table.clone(), entry.row_count() as u64)).collect();
    tracing::info!(safety_capture_id = %capture.id, tables = capture.tables.len(), "safety capture saved");
    Ok(())
}

fn record_live_counts(plan: &RestorePlan<'_>, tables: &[String], draft: &mut RestoreDraft) {
    for table in tables {
        match with_retry(&plan.config.retry, plan.cancel, &format!("count {table}"), || plan.transport.count_rows(table))
        {
            Ok(count) => {
                draft.before_counts.insert(table.clone(), count);
            }
            Err(err) => tracing::warn!(table = %table, error = %err, "could not count rows before restore"),
        }
    }
}

/// Check the target and resolve every table, collecting all defects.
fn validate(
    plan: &RestorePlan<'_>,
    resolver: &mut ChainResolver<'_>,
    target: &Arc<Snapshot>,
    draft: &mut RestoreDraft,
) -> Result<Vec<(String, ResolvedTable)>, VaultError> {
    let mut defects = Vec::new();
    if plan.kind == RestoreKind::Rollback && target.protects_restore_of.is_none() {
        defects.push(format!("snapshot {} is not a safety capture", target.id));
    }

    let mut payloads = Vec::with_capacity(target.tables.len());
    for table in target.tables.keys() {
        match resolver.resolve(target, table) {
            Ok(resolved) => payloads.push((table.clone(), resolved)),
            Err(err) => defects.push(err.to_string()),
        }
    }

    if plan.kind == RestoreKind::Restore {
        for critical in &plan.config.critical_tables {
            match payloads.iter().find(|(table, _)| table == critical) {
                Some((_, resolved)) if resolved.rows().is_empty() => {
                    defects.push(format!("critical table `{critical}` is empty"));
                }
                Some(_) => {}
                None if target.tables.contains_key(critical) => {}
                None => defects.push(format!("critical table `{critical}` is missing")),
            }
        }
    }

    if defects.is_empty() {
        Ok(payloads)
    } else {
        draft.validation_defects.extend(defects);
        Err(VaultError::Validation(draft.validation_defects.clone()))
    }
}

fn absorb(result: &mut TableRestoreResult, outcome: UpsertOutcome) {
    result.inserted += outcome.inserted;
    result.updated += outcome.updated;
    result.errors += outcome.errors;
    for detail in outcome.error_details {
        note(result, detail);
    }
}

fn note(result: &mut TableRestoreResult, detail: String) {
    if result.error_details.len() < MAX_ERROR_DETAILS {
        result.error_details.push(detail);
    }
}

/// Upsert one table batch by batch. Batches run strictly in order.
fn restore_table(plan: &RestorePlan<'_>, table: &str, rows: &[Row], mirror: bool) -> TableRestoreResult {
    let config = plan.config;
    let key = config.key_for(table);
    let excluded = config.excluded_for(table);
    let mut result = TableRestoreResult::default();
    let mut written = 0;

    for (index, batch) in rows.chunks(config.batch_size).enumerate() {
        if plan.cancel.is_cancelled() {
            result.failed = true;
            result.failure_reason = Some(VaultError::Cancelled.to_string());
            result.skipped_rows = rows.len() - written;
            return result;
        }

        let label = format!("upsert {table} batch {index}");
        match with_retry(&config.retry, plan.cancel, &label, || plan.transport.upsert_batch(table, key, batch, &excluded)) {
            Ok(outcome) => absorb(&mut result, outcome),
            Err(err) if err.is_retryable() => {
                result.errors += batch.len();
                note(&mut result, err.to_string());
            }
            Err(err) => {
                tracing::warn!(table, batch = index, error = %err, "batch rejected; replaying row by row");
                for row in batch {
                    let single = std::slice::from_ref(row);
                    match with_retry(&config.retry, plan.cancel, &label, || {
                        plan.transport.upsert_batch(table, key, single, &excluded)
                    }) {
                        Ok(outcome) => absorb(&mut result, outcome),
                        Err(err) => {
                            result.errors += 1;
                            note(&mut result, err.to_string());
                        }
                    }
                }
            }
        }
        written += batch.len();

        if result.errors > config.max_table_errors {
            result.failed = true;
            result.failure_reason =
                Some(format!("error threshold exceeded ({} > {})", result.errors, config.max_table_errors));
            result.skipped_rows = rows.len() - written;
            return result;
        }
    }

    if mirror {
        match prune_extra_rows(plan, table, key, rows) {
            Ok(pruned) => result.pruned = pruned,
            Err(err) => {
                result.failed = true;
                result.failure_reason = Some(format!("prune failed: {err}"));
            }
        }
    }
    result
}

/// Delete live rows whose key is absent from `rows`.
fn prune_extra_rows(plan: &RestorePlan<'_>, table: &str, key: &str, rows: &[Row]) -> Result<usize, VaultError> {
    let keep: BTreeSet<String> = rows.iter().filter_map(|row| row.get(key)).map(canonical_json).collect();
    let live = fetch_all(plan.transport, plan.config, plan.cancel, table)?;
    let extra: Vec<Value> = live
        .iter()
        .filter_map(|row| row.get(key))
        .filter(|value| !value.is_null() && !keep.contains(&canonical_json(value)))
        .cloned()
        .collect();
    if extra.is_empty() {
        return Ok(0);
    }
    let label = format!("prune {table}");
    let pruned = with_retry(&plan.config.retry, plan.cancel, &label, || plan.transport.delete_rows(table, key, &extra))?;
    tracing::info!(table, pruned, "removed rows created after the safety capture");
    Ok(pruned)
}

fn verify_counts(plan: &RestorePlan<'_>, expected: &BTreeMap<String, usize>, draft: &mut RestoreDraft) {
    for (table, rows) in expected {
        let counted =
            with_retry(&plan.config.retry, plan.cancel, &format!("count {table}"), || plan.transport.count_rows(table));
        match counted {
            Ok(actual) => {
                draft.after_counts.insert(table.clone(), actual);
                if let Some(mismatch) = CountMismatch::between(table, *rows as u64, actual) {
                    tracing::warn!(
                        table = %table,
                        expected = mismatch.expected,
                        actual = mismatch.actual,
                        "row count differs from restored payload"
                    );
                    draft.count_mismatches.push(mismatch);
                }
            }
            Err(err) => tracing::warn!(table = %table, error = %err, "could not count rows after restore"),
        }
    }
}
