#![forbid(unsafe_code)]

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::storage::fsm::FsmStatistics;
use crate::storage::index::IndexBulkDeleteResult;
use crate::types::{BlockNumber, RelId};

/// Diagnostic classes surfaced as warnings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Caller may not vacuum the relation.
    PermissionDenied,
    /// Index, view or another relation kind that has no heap of its own.
    WrongKind,
    /// Temporary relation of another session.
    OtherSessionTemp,
    /// Relation lock could not be acquired in time.
    LockNotAcquired,
    /// In-progress transaction disabled full compaction for the pass.
    CannotShrink,
    /// All-zero page found and initialized.
    UninitializedPage,
    /// Relocation of an update chain was abandoned.
    ChainAbandoned,
    /// Index and heap disagree on row-version count.
    IndexCountMismatch,
    /// Freeze cutoff clamped to the oldest running transaction.
    OldestXminFarInPast,
    /// Transaction-id wraparound is near or has happened.
    Wraparound,
    /// Relation's unit of work aborted on an integrity failure.
    RelationFailed,
}

/// One recorded warning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VacuumWarning {
    /// Warning class.
    pub kind: WarningKind,
    /// Relation concerned, when there is one.
    pub relation: Option<String>,
    /// Human-readable message.
    pub message: String,
}

/// What happened to one relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationOutcome {
    /// Vacuumed and committed.
    Vacuumed,
    /// Skipped with a warning.
    Skipped,
    /// Dropped before it could be processed.
    Vanished,
    /// Unit of work aborted.
    Failed,
}

/// Result of one index pass.
#[derive(Clone, Debug, Serialize)]
pub struct IndexReport {
    /// Index name.
    pub name: String,
    /// Index relation id.
    pub index: RelId,
    /// Counters returned by the access method.
    #[serde(flatten)]
    pub result: IndexBulkDeleteResult,
}

/// Per-relation summary.
#[derive(Clone, Debug, Serialize)]
pub struct RelationReport {
    /// Qualified relation name.
    pub relation: String,
    /// Relation id.
    pub rel: RelId,
    /// Outcome of the relation's unit of work.
    pub outcome: RelationOutcome,
    /// Pages before the pass.
    pub pages_before: BlockNumber,
    /// Pages after the pass.
    pub pages_after: BlockNumber,
    /// Row versions removed.
    pub removed: u64,
    /// Row versions kept.
    pub kept: u64,
    /// Kept versions whose deleter is still visible to someone.
    pub recently_dead: u64,
    /// Slots that were already unused.
    pub unused: u64,
    /// Creator ids rewritten to the frozen id.
    pub frozen: u64,
    /// Row versions relocated by full compaction.
    pub moved: u64,
    /// Pages that are or will become empty.
    pub empty_pages: u64,
    /// Index cleanup cycles (lazy mode).
    pub index_scans: u32,
    /// Full compaction was possible for this pass.
    pub shrinkable: bool,
    /// Analyzer ran for the relation.
    pub analyzed: bool,
    /// Final index statistics.
    pub indexes: Vec<IndexReport>,
    /// Wall-clock time spent, in milliseconds.
    pub elapsed_ms: f64,
}

impl RelationReport {
    pub(crate) fn new(relation: String, rel: RelId, outcome: RelationOutcome) -> Self {
        Self {
            relation,
            rel,
            outcome,
            pages_before: 0,
            pages_after: 0,
            removed: 0,
            kept: 0,
            recently_dead: 0,
            unused: 0,
            frozen: 0,
            moved: 0,
            empty_pages: 0,
            index_scans: 0,
            shrinkable: true,
            analyzed: false,
            indexes: Vec::new(),
            elapsed_ms: 0.0,
        }
    }

    /// Replaces the entry for `index`, keeping the latest pass.
    pub(crate) fn record_index(&mut self, index: IndexReport) {
        self.indexes.retain(|existing| existing.index != index.index);
        self.indexes.push(index);
    }
}

/// Summary of one vacuum command.
#[derive(Clone, Debug, Serialize)]
pub struct VacuumReport {
    /// Database vacuumed.
    pub database: String,
    /// Full compaction was requested.
    pub full: bool,
    /// No relation was named.
    pub database_wide: bool,
    /// One entry per relation visited, overflow relations included.
    pub relations: Vec<RelationReport>,
    /// Every warning raised.
    pub warnings: Vec<VacuumWarning>,
    /// Database watermarks were overwritten.
    pub watermarks_advanced: bool,
    /// Transaction statuses discarded by history truncation.
    pub history_truncated: usize,
    /// Free-space directory usage at the end of a database-wide run.
    pub fsm: Option<FsmStatistics>,
    /// Wall-clock time, in milliseconds.
    pub elapsed_ms: f64,
}

impl VacuumReport {
    /// Warnings of one kind.
    pub fn warnings_of(&self, kind: WarningKind) -> impl Iterator<Item = &VacuumWarning> {
        self.warnings.iter().filter(move |w| w.kind == kind)
    }

    /// Report entry for `rel`, if it was visited.
    pub fn relation(&self, rel: RelId) -> Option<&RelationReport> {
        self.relations.iter().find(|r| r.rel == rel)
    }
}

/// Warning sink plus the verbosity switch for detail messages.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    verbose: bool,
    warnings: Vec<VacuumWarning>,
}

impl Diagnostics {
    pub(crate) fn new(verbose: bool) -> Self {
        Self {
            verbose,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn warn(&mut self, kind: WarningKind, relation: Option<&str>, message: String) {
        warn!(kind = ?kind, relation = relation.unwrap_or(""), "vacuum.warning: {message}");
        self.warnings.push(VacuumWarning {
            kind,
            relation: relation.map(str::to_string),
            message,
        });
    }

    /// Per-relation detail: info when verbose, debug otherwise.
    pub(crate) fn detail(&self, relation: &str, message: &str) {
        if self.verbose {
            info!(relation, "vacuum.detail: {message}");
        } else {
            debug!(relation, "vacuum.detail: {message}");
        }
    }

    pub(crate) fn count(&self, kind: WarningKind) -> usize {
        self.warnings.iter().filter(|w| w.kind == kind).count()
    }

    pub(crate) fn into_warnings(self) -> Vec<VacuumWarning> {
        self.warnings
    }
}
