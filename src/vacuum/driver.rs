#![forbid(unsafe_code)]

//! Command driver: relation selection, per-relation transactions and locks,
//! permission and kind checks, overflow-relation recursion and the
//! database-wide finish.

use std::time::Instant;

use tracing::{debug, info};

use crate::primitives::concurrency::{LockMode, SessionLockGuard};
use crate::storage::catalog::{OwnershipCheck, RelKind, RelationResolver};
use crate::storage::database::{Cluster, Database, Session};
use crate::storage::heapam::HeapRelation;
use crate::types::{RelId, Result, VacError};
use crate::vacuum::cost::CostBalance;
use crate::vacuum::full::full_vacuum_rel;
use crate::vacuum::lazy::lazy_vacuum_rel;
use crate::vacuum::limits::compute_limits;
use crate::vacuum::options::{VacuumConfig, VacuumOptions};
use crate::vacuum::report::{
    Diagnostics, RelationOutcome, RelationReport, VacuumReport, WarningKind,
};
use crate::vacuum::stats::{truncate_history, update_database_stats, RunWatermarks};
use crate::vacuum::RelationPass;

/// Planner-statistics collector run after a relation was vacuumed when the
/// `analyze` option is set.
pub trait Analyzer {
    /// Recomputes statistics for `heap`.
    fn analyze(&self, db: &Database, heap: &HeapRelation) -> Result<()>;
}

/// Analyzer that only logs the counters vacuum just recorded.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingAnalyzer;

impl Analyzer for LoggingAnalyzer {
    fn analyze(&self, db: &Database, heap: &HeapRelation) -> Result<()> {
        let stats = db.catalog().relstats().get(heap.id());
        info!(
            rel = heap.id().0,
            pages = stats.pages,
            tuples = stats.tuples,
            "vacuum.analyze"
        );
        Ok(())
    }
}

/// Vacuums `db` as `session`, either the relation named in `options` or
/// every ordinary relation.
pub fn vacuum(
    cluster: &Cluster,
    db: &Database,
    session: &Session,
    options: &VacuumOptions,
    config: &VacuumConfig,
) -> Result<VacuumReport> {
    vacuum_with_analyzer(cluster, db, session, options, config, &LoggingAnalyzer)
}

/// [`vacuum`] with a caller-supplied analyzer.
pub fn vacuum_with_analyzer(
    cluster: &Cluster,
    db: &Database,
    session: &Session,
    options: &VacuumOptions,
    config: &VacuumConfig,
    analyzer: &dyn Analyzer,
) -> Result<VacuumReport> {
    let started = Instant::now();
    let mut diag = Diagnostics::new(options.verbose);
    let database_wide = options.relation.is_none();
    let targets = match &options.relation {
        Some(name) => vec![db.catalog().resolve_relation(name)?],
        None => db.catalog().relation_ids(RelKind::Ordinary),
    };

    let xact = cluster.xact();
    let initial = compute_limits(xact, xact.next_xid(), options.freeze, config.freeze_min_age);
    let marks = RunWatermarks {
        vacuum_xid: initial.limits.oldest_xmin,
        frozen_xid: initial.limits.freeze_limit,
    };
    info!(
        db = db.id().0,
        relations = targets.len(),
        full = options.full,
        "vacuum.start"
    );

    let run = Run {
        db,
        session,
        options,
        config,
    };
    let mut relations = Vec::new();
    let mut all_rels = true;
    for rel in targets {
        session.cancel_token().check()?;
        if !run.vacuum_rel(rel, RelKind::Ordinary, &mut relations, &mut diag)? {
            all_rels = false;
        }
        if options.analyze {
            let vacuumed = relations
                .iter_mut()
                .find(|r| r.rel == rel && r.outcome == RelationOutcome::Vacuumed);
            if let (Some(entry), Some(heap)) = (vacuumed, db.relation(rel)) {
                analyzer.analyze(db, &heap)?;
                entry.analyzed = true;
            }
        }
    }

    let mut fsm = None;
    let mut watermarks_advanced = false;
    let mut history_truncated = 0;
    if database_wide {
        let stats = cluster.fsm().statistics();
        info!(
            relations = stats.relations,
            pages_stored = stats.pages_stored,
            pages_requested = stats.pages_requested,
            max_pages = stats.max_pages,
            "vacuum.fsm.usage"
        );
        fsm = Some(stats);
        if all_rels {
            watermarks_advanced = update_database_stats(cluster, db, marks);
            history_truncated = truncate_history(cluster, marks, xact.next_xid(), config, &mut diag)?;
            cluster.persist_cluster_file()?;
        } else {
            debug!(db = db.id().0, "vacuum.db.watermarks_kept");
        }
    }

    Ok(VacuumReport {
        database: db.name(),
        full: options.full,
        database_wide,
        relations,
        warnings: diag.into_warnings(),
        watermarks_advanced,
        history_truncated,
        fsm,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
    })
}

struct Run<'a> {
    db: &'a Database,
    session: &'a Session,
    options: &'a VacuumOptions,
    config: &'a VacuumConfig,
}

impl Run<'_> {
    fn lock_mode(&self) -> LockMode {
        if self.options.full {
            LockMode::AccessExclusive
        } else {
            LockMode::ShareUpdateExclusive
        }
    }

    fn may_vacuum(&self, rel: RelId, is_shared: bool) -> bool {
        let role = self.session.role();
        self.session.is_superuser()
            || self.db.catalog().owns_relation(role, rel)
            || (self.db.def().owner == role && !is_shared)
    }

    /// Vacuums one relation, then its overflow relation, in separate
    /// transactions. Returns false if anything was skipped.
    fn vacuum_rel(
        &self,
        rel: RelId,
        expected: RelKind,
        reports: &mut Vec<RelationReport>,
        diag: &mut Diagnostics,
    ) -> Result<bool> {
        let started = Instant::now();
        let db = self.db;
        let session = self.session;
        session.cancel_token().check()?;
        if db.catalog().get(rel).is_none() {
            debug!(rel = rel.0, "vacuum.rel.vanished");
            return Ok(true);
        }

        let mode = self.lock_mode();
        let tx = if self.options.full {
            db.begin(session)
        } else {
            db.begin_lazy_vacuum(session)
        };
        if let Err(err) = tx.lock_relation(rel, mode) {
            tx.abort();
            let VacError::LockTimeout { .. } = err else {
                return Err(err);
            };
            let name = db
                .catalog()
                .get(rel)
                .map_or_else(|| rel.to_string(), |def| def.qualified_name());
            diag.warn(
                WarningKind::LockNotAcquired,
                Some(&name),
                format!("skipping \"{name}\" --- could not obtain lock"),
            );
            reports.push(RelationReport::new(name, rel, RelationOutcome::Skipped));
            return Ok(false);
        }

        let Some(def) = db.catalog().get(rel) else {
            tx.commit()?;
            reports.push(RelationReport::new(rel.to_string(), rel, RelationOutcome::Vanished));
            return Ok(true);
        };
        let relname = def.qualified_name();
        let skip = if !self.may_vacuum(rel, def.is_shared) {
            Some((
                WarningKind::PermissionDenied,
                format!("skipping \"{relname}\" --- only table or database owner can vacuum it"),
            ))
        } else if def.kind != expected {
            Some((
                WarningKind::WrongKind,
                format!(
                    "skipping \"{relname}\" --- cannot vacuum indexes, views, or special system tables"
                ),
            ))
        } else if def.temp_session.is_some_and(|owner| owner != session.id()) {
            Some((
                WarningKind::OtherSessionTemp,
                format!("skipping \"{relname}\" --- temporary table of another session"),
            ))
        } else {
            None
        };
        if let Some((kind, message)) = skip {
            tx.commit()?;
            diag.warn(kind, Some(&relname), message);
            reports.push(RelationReport::new(relname, rel, RelationOutcome::Skipped));
            return Ok(false);
        }
        let Some(heap) = db.relation(rel) else {
            tx.commit()?;
            reports.push(RelationReport::new(relname, rel, RelationOutcome::Vanished));
            return Ok(true);
        };

        let guard = SessionLockGuard::acquire(db.locks().clone(), rel, mode, session.id())?;
        let outcome = compute_limits(
            db.xact(),
            tx.xid(),
            self.options.freeze,
            self.config.freeze_min_age,
        );
        if outcome.clamped {
            diag.warn(
                WarningKind::OldestXminFarInPast,
                Some(&relname),
                "oldest xmin is far in the past; \
                 close open transactions soon to avoid wraparound problems"
                    .to_string(),
            );
        }
        diag.detail(&relname, &format!("vacuuming \"{relname}\""));

        let mut report = RelationReport::new(relname.clone(), rel, RelationOutcome::Vacuumed);
        let work = {
            let _gate = db.write_gate();
            let pass = RelationPass {
                tx: &tx,
                heap: &heap,
                limits: outcome.limits,
                config: self.config,
                relname: &relname,
                cost: CostBalance::new(self.config, heap.file().usage()),
            };
            if self.options.full {
                full_vacuum_rel(&pass, diag, &mut report)
            } else {
                lazy_vacuum_rel(&pass, diag, &mut report)
            }
        };
        let mut result = true;
        match work {
            Ok(()) => {
                tx.commit()?;
                report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                info!(
                    rel = rel.0,
                    removed = report.removed,
                    kept = report.kept,
                    pages = report.pages_after,
                    "vacuum.rel.done"
                );
                reports.push(report);
            }
            Err(err) if err.is_relation_local() => {
                tx.abort();
                diag.warn(
                    WarningKind::RelationFailed,
                    Some(&relname),
                    format!("vacuum of \"{relname}\" aborted: {err}"),
                );
                report.outcome = RelationOutcome::Failed;
                report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                reports.push(report);
                result = false;
            }
            Err(err) => {
                tx.abort();
                return Err(err);
            }
        }

        if let Some(toast) = def.toast_relid {
            if !self.vacuum_rel(toast, RelKind::Toast, reports, diag)? {
                result = false;
            }
        }
        drop(guard);
        Ok(result)
    }
}
