use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{SnapshotId, VaultError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RestoreId(pub Ulid);

impl RestoreId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RestoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RestoreId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreState {
    Idle,
    SafetyCapture,
    Validate,
    Restoring,
    Verify,
    Done,
    RolledBack,
    FailedNeedsManualRollback,
    Aborted,
}

impl RestoreState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::SafetyCapture => "SAFETY_CAPTURE",
            Self::Validate => "VALIDATE",
            Self::Restoring => "RESTORING",
            Self::Verify => "VERIFY",
            Self::Done => "DONE",
            Self::RolledBack => "ROLLED_BACK",
            Self::FailedNeedsManualRollback => "FAILED_NEEDS_MANUAL_ROLLBACK",
            Self::Aborted => "ABORTED",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::RolledBack | Self::FailedNeedsManualRollback | Self::Aborted)
    }
}

impl Display for RestoreState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreEvent {
    Begin { safe: bool },
    CaptureSaved,
    CaptureFailed,
    Validated,
    ValidationFailed,
    WritesFinished,
    WritesCancelled,
    Verified { failed_tables: usize, attempted_tables: usize, rollback: bool },
}

impl RestoreEvent {
    fn name(self) -> &'static str {
        match self {
            Self::Begin { .. } => "begin",
            Self::CaptureSaved => "capture_saved",
            Self::CaptureFailed => "capture_failed",
            Self::Validated => "validated",
            Self::ValidationFailed => "validation_failed",
            Self::WritesFinished => "writes_finished",
            Self::WritesCancelled => "writes_cancelled",
            Self::Verified { .. } => "verified",
        }
    }
}

/// Compute the next state. Every pair not listed is rejected, so a restore can
/// never reach RESTORING without passing through VALIDATE.
///
/// # Errors
/// Returns [`VaultError::InvalidTransition`] for an event the state does not accept.
pub fn transition(state: RestoreState, event: RestoreEvent) -> Result<RestoreState, VaultError> {
    use RestoreEvent as E;
    use RestoreState as S;

    let next = match (state, event) {
        (S::Idle, E::Begin { safe: true }) => S::SafetyCapture,
        (S::Idle, E::Begin { safe: false }) | (S::SafetyCapture, E::CaptureSaved) => S::Validate,
        (S::SafetyCapture, E::CaptureFailed) | (S::Validate, E::ValidationFailed) => S::Aborted,
        (S::Validate, E::Validated) => S::Restoring,
        (S::Restoring, E::WritesFinished) => S::Verify,
        (S::Restoring, E::WritesCancelled) => S::FailedNeedsManualRollback,
        (S::Verify, E::Verified { failed_tables, attempted_tables, rollback }) => {
            if failed_tables == 0 {
                if rollback {
                    S::RolledBack
                } else {
                    S::Done
                }
            } else if failed_tables * 2 > attempted_tables {
                S::FailedNeedsManualRollback
            } else {
                S::Done
            }
        }
        (from, event) => {
            return Err(VaultError::InvalidTransition { from, event: event.name().to_string() });
        }
    };
    Ok(next)
}

/// Tracks the current state and every state visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreMachine {
    state: RestoreState,
    trace: Vec<RestoreState>,
}

impl RestoreMachine {
    #[must_use]
    pub fn new() -> Self {
        Self { state: RestoreState::Idle, trace: vec![RestoreState::Idle] }
    }

    #[must_use]
    pub fn state(&self) -> RestoreState {
        self.state
    }

    #[must_use]
    pub fn trace(&self) -> &[RestoreState] {
        &self.trace
    }

    /// Apply one event.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] and leaves the state unchanged.
    pub fn apply(&mut self, event: RestoreEvent) -> Result<RestoreState, VaultError> {
        let next = transition(self.state, event)?;
        self.state = next;
        self.trace.push(next);
        Ok(next)
    }
}

impl Default for RestoreMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RestoreKind {
    Restore,
    Rollback,
}

impl RestoreKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restore => "restore",
            Self::Rollback => "rollback",
        }
    }

    /// # Errors
    /// Returns an error string for unknown kinds.
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "restore" => Ok(Self::Restore),
            "rollback" => Ok(Self::Rollback),
            other => Err(format!("unknown restore kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    Succeeded,
    PartiallyFailed,
    RolledBack,
    FailedNeedsManualRollback,
    Aborted,
}

impl RestoreOutcome {
    /// Map a terminal state to the reported outcome.
    #[must_use]
    pub fn from_terminal(state: RestoreState, failed_tables: usize) -> Option<Self> {
        match state {
            RestoreState::Done if failed_tables == 0 => Some(Self::Succeeded),
            RestoreState::Done => Some(Self::PartiallyFailed),
            RestoreState::RolledBack => Some(Self::RolledBack),
            RestoreState::FailedNeedsManualRollback => Some(Self::FailedNeedsManualRollback),
            RestoreState::Aborted => Some(Self::Aborted),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::PartiallyFailed => "partially_failed",
            Self::RolledBack => "rolled_back",
            Self::FailedNeedsManualRollback => "failed_needs_manual_rollback",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableRestoreResult {
    pub inserted: usize,
    pub updated: usize,
    pub errors: usize,
    pub failed: bool,
    #[serde(default)]
    pub skipped_rows: usize,
    #[serde(default)]
    pub pruned: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// First few per-row error messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_details: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    Missing,
    Extra,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CountMismatch {
    pub table: String,
    pub expected: u64,
    pub actual: u64,
    pub kind: MismatchKind,
}

impl CountMismatch {
    #[must_use]
    pub fn between(table: &str, expected: u64, actual: u64) -> Option<Self> {
        let kind = match actual.cmp(&expected) {
            std::cmp::Ordering::Less => MismatchKind::Missing,
            std::cmp::Ordering::Greater => MismatchKind::Extra,
            std::cmp::Ordering::Equal => return None,
        };
        Some(Self { table: table.to_string(), expected, actual, kind })
    }
}

/// Immutable audit record of one restore or rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreRecord {
    pub restore_id: RestoreId,
    pub kind: RestoreKind,
    pub target_snapshot_id: SnapshotId,
    pub safety_capture_id: Option<SnapshotId>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    pub before_counts: BTreeMap<String, u64>,
    pub after_counts: BTreeMap<String, u64>,
    pub per_table_result: BTreeMap<String, TableRestoreResult>,
    #[serde(default)]
    pub count_mismatches: Vec<CountMismatch>,
    #[serde(default)]
    pub validation_defects: Vec<String>,
    pub state_trace: Vec<RestoreState>,
    pub outcome: RestoreOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RestoreRecord {
    #[must_use]
    pub fn failed_tables(&self) -> Vec<String> {
        self.per_table_result.iter().filter(|(_, result)| result.failed).map(|(name, _)| name.clone()).collect()
    }
}

/// Mutable accumulator for a restore in flight. Sealing consumes it, so a
/// finished record cannot be edited afterwards.
#[derive(Debug, Clone)]
pub struct RestoreDraft {
    pub restore_id: RestoreId,
    pub kind: RestoreKind,
    pub target_snapshot_id: SnapshotId,
    pub safety_capture_id: Option<SnapshotId>,
    pub started_at: OffsetDateTime,
    pub before_counts: BTreeMap<String, u64>,
    pub after_counts: BTreeMap<String, u64>,
    pub per_table_result: BTreeMap<String, TableRestoreResult>,
    pub count_mismatches: Vec<CountMismatch>,
    pub validation_defects: Vec<String>,
    machine: RestoreMachine,
}

impl RestoreDraft {
    #[must_use]
    pub fn new(kind: RestoreKind, target_snapshot_id: SnapshotId, started_at: OffsetDateTime) -> Self {
        Self {
            restore_id: RestoreId::new(),
            kind,
            target_snapshot_id,
            safety_capture_id: None,
            started_at,
            before_counts: BTreeMap::new(),
            after_counts: BTreeMap::new(),
            per_table_result: BTreeMap::new(),
            count_mismatches: Vec::new(),
            validation_defects: Vec::new(),
            machine: RestoreMachine::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> RestoreState {
        self.machine.state()
    }

    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] when the event is not accepted.
    pub fn apply(&mut self, event: RestoreEvent) -> Result<RestoreState, VaultError> {
        self.machine.apply(event)
    }

    #[must_use]
    pub fn failed_table_count(&self) -> usize {
        self.per_table_result.values().filter(|result| result.failed).count()
    }

    /// Freeze the draft into a record.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidTransition`] when the machine is not in a terminal state.
    pub fn seal(self, completed_at: OffsetDateTime, error: Option<String>) -> Result<RestoreRecord, VaultError> {
        let state = self.machine.state();
        let Some(outcome) = RestoreOutcome::from_terminal(state, self.failed_table_count()) else {
            return Err(VaultError::InvalidTransition { from: state, event: "seal".to_string() });
        };
        Ok(RestoreRecord {
            restore_id: self.restore_id,
            kind: self.kind,
            target_snapshot_id: self.target_snapshot_id,
            safety_capture_id: self.safety_capture_id,
            started_at: self.started_at,
            completed_at,
            before_counts: self.before_counts,
            after_counts: self.after_counts,
            per_table_result: self.per_table_result,
            count_mismatches: self.count_mismatches,
            validation_defects: self.validation_defects,
            state_trace: self.machine.trace().to_vec(),
            outcome,
            error,
        })
    }
}
