#![forbid(unsafe_code)]

//! Relation counters and database-wide watermarks.
//!
//! Both live in non-versioned side tables and are overwritten in place.
//! History truncation runs only after a database-wide pass that skipped
//! nothing.

use tracing::{debug, info};

use crate::primitives::wal::WalRecord;
use crate::storage::catalog::{DatabaseStats, RelStats};
use crate::storage::database::{Cluster, Database};
use crate::types::{BlockNumber, Result, Xid};
use crate::vacuum::options::VacuumConfig;
use crate::vacuum::report::{Diagnostics, WarningKind};
use crate::vacuum::RelationPass;

/// Overwrites the relation's page and row counts. A relation left without
/// indexes cannot keep its primary-key flag.
pub(crate) fn update_relstats(
    pass: &RelationPass<'_>,
    pages: BlockNumber,
    tuples: u64,
    has_index: bool,
) -> RelStats {
    let stats = pass
        .db()
        .catalog()
        .relstats()
        .overwrite_in_place(pass.rel(), |row| {
            row.pages = pages;
            row.tuples = tuples;
            row.has_index = has_index;
            if !has_index {
                row.has_pkey = false;
            }
        });
    debug!(rel = pass.rel().0, pages, tuples, has_index, "vacuum.rel.stats");
    stats
}

/// Watermarks fixed at the start of a database-wide run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RunWatermarks {
    /// Oldest transaction still visible to anyone when the run started.
    pub(crate) vacuum_xid: Xid,
    /// Freeze cutoff used by the run.
    pub(crate) frozen_xid: Xid,
}

/// Overwrites the database row. Neither watermark moves backward.
pub(crate) fn update_database_stats(cluster: &Cluster, db: &Database, marks: RunWatermarks) -> bool {
    let table = cluster.database_stats();
    let mut next = DatabaseStats {
        vacuum_xid: marks.vacuum_xid,
        frozen_xid: marks.frozen_xid,
    };
    if let Some(current) = table.get(db.id()) {
        if current.vacuum_xid.is_normal() && current.vacuum_xid.follows(next.vacuum_xid) {
            next.vacuum_xid = current.vacuum_xid;
        }
        if current.frozen_xid.is_normal() && current.frozen_xid.follows(next.frozen_xid) {
            next.frozen_xid = current.frozen_xid;
        }
        if current == next {
            return false;
        }
    }
    table.overwrite_in_place(db.id(), next);
    info!(
        db = db.id().0,
        vacuum_xid = next.vacuum_xid.0,
        frozen_xid = next.frozen_xid.0,
        "vacuum.db.watermarks"
    );
    true
}

/// Discards transaction statuses no database can still need, then warns
/// about approaching wraparound. `my_xid` is the caller's current id.
/// Returns the number of statuses discarded.
pub(crate) fn truncate_history(
    cluster: &Cluster,
    marks: RunWatermarks,
    my_xid: Xid,
    config: &VacuumConfig,
    diag: &mut Diagnostics,
) -> Result<usize> {
    let mut vacuum_xid = marks.vacuum_xid;
    let mut frozen_xid = marks.frozen_xid;
    let mut vacuum_wrapped = false;
    let mut frozen_wrapped = false;

    let stats = cluster.database_stats().all();
    for db in cluster.databases() {
        if !db.def().allow_conn {
            continue;
        }
        let Some(row) = stats.get(&db.id()) else {
            continue;
        };
        if !row.vacuum_xid.is_normal() || !row.frozen_xid.is_normal() {
            continue;
        }
        if my_xid.precedes(row.vacuum_xid) {
            vacuum_wrapped = true;
        } else if row.vacuum_xid.precedes(vacuum_xid) {
            vacuum_xid = row.vacuum_xid;
        }
        if my_xid.precedes(row.frozen_xid) {
            frozen_wrapped = true;
        } else if row.frozen_xid.precedes(frozen_xid) {
            frozen_xid = row.frozen_xid;
        }
    }

    if vacuum_wrapped {
        diag.warn(
            WarningKind::Wraparound,
            None,
            "some databases have not been vacuumed in over 2 billion transactions; \
             you may have already suffered transaction-wraparound data loss"
                .to_string(),
        );
        return Ok(0);
    }

    let wal = cluster.wal();
    wal.append(WalRecord::ClogTruncate { oldest: vacuum_xid })?;
    wal.flush()?;
    let discarded = cluster.xact().truncate_history(vacuum_xid);
    debug!(oldest = vacuum_xid.0, discarded, "vacuum.clog.truncated");

    if frozen_wrapped {
        diag.warn(
            WarningKind::Wraparound,
            None,
            "some databases have not been vacuumed in over 1 billion transactions; \
             better vacuum them soon, or you may have a wraparound failure"
                .to_string(),
        );
    } else {
        let age = my_xid.age_since(frozen_xid);
        let limit = i64::from(config.wraparound_warn_age);
        if i64::from(age) > limit {
            let horizon = i64::from(u32::MAX >> 1) - i64::from(age);
            diag.warn(
                WarningKind::Wraparound,
                None,
                format!(
                    "some databases have not been vacuumed in {age} transactions; \
                     better vacuum them within {horizon} transactions, \
                     or you may have a wraparound failure"
                ),
            );
        }
    }
    Ok(discarded)
}
