#![forbid(unsafe_code)]

//! Vacuum engine.
//!
//! Reclaims space held by row versions no transaction can see any more.
//! Two modes share the visibility oracle, page helpers, index synchronizer
//! and statistics updater:
//!
//! * **lazy** (default) reaps dead versions in place under a lock that lets
//!   readers and writers continue, and may truncate an empty tail when an
//!   exclusive lock happens to be free;
//! * **full** takes an exclusive lock, relocates versions (update chains as a
//!   whole) from the end of the heap into free space near the start, and
//!   truncates the file.
//!
//! Each relation is processed in its own transaction. [`vacuum`] is the
//! entry point; it returns a [`VacuumReport`].

mod chain;
mod cost;
mod driver;
mod fsm;
mod full;
mod index;
mod lazy;
mod limits;
mod options;
mod page_ops;
mod pagelist;
mod repair;
mod report;
mod scan;
mod stats;
pub mod visibility;

pub use driver::{vacuum, vacuum_with_analyzer, Analyzer, LoggingAnalyzer};
pub use limits::{compute_limits, LimitsOutcome, VacuumLimits};
pub use options::{VacuumConfig, VacuumOptions};
pub use report::{
    IndexReport, RelationOutcome, RelationReport, VacuumReport, VacuumWarning, WarningKind,
};
pub use visibility::{satisfies_vacuum, Classified, HtsvResult};

use tracing::trace;

use crate::primitives::wal::Wal;
use crate::storage::database::{Database, Transaction};
use crate::storage::fsm::FreeSpaceMap;
use crate::storage::heapam::HeapRelation;
use crate::storage::relation::RelationFile;
use crate::storage::xact::TransactionManager;
use crate::types::{RelId, Result, Xid};
use crate::vacuum::cost::CostBalance;

/// One relation's unit of work: its transaction, heap and watermarks.
pub(crate) struct RelationPass<'a> {
    pub(crate) tx: &'a Transaction<'a>,
    pub(crate) heap: &'a HeapRelation,
    pub(crate) limits: VacuumLimits,
    pub(crate) config: &'a VacuumConfig,
    pub(crate) relname: &'a str,
    pub(crate) cost: CostBalance,
}

impl<'a> RelationPass<'a> {
    pub(crate) fn db(&self) -> &'a Database {
        self.tx.database()
    }

    pub(crate) fn wal(&self) -> &'a Wal {
        self.db().wal()
    }

    pub(crate) fn xact(&self) -> &'a TransactionManager {
        self.db().xact()
    }

    pub(crate) fn fsm(&self) -> &'a FreeSpaceMap {
        self.db().fsm()
    }

    pub(crate) fn rel(&self) -> RelId {
        self.heap.id()
    }

    pub(crate) fn file(&self) -> &'a RelationFile {
        self.heap.file()
    }

    /// Id of the vacuum's own transaction; stamped as mover on relocations.
    pub(crate) fn xid(&self) -> Xid {
        self.tx.xid()
    }

    pub(crate) fn check_cancel(&self) -> Result<()> {
        self.tx.session().cancel_token().check()
    }

    /// Cancellation check, then a nap if page accesses since the last nap
    /// cost more than the configured limit.
    pub(crate) fn delay_point(&self) -> Result<()> {
        self.check_cancel()?;
        if let Some(nap) = self.cost.accrue(self.file().usage()) {
            trace!(rel = self.rel().0, nap_us = nap.as_micros() as u64, "vacuum.cost.nap");
            std::thread::sleep(nap);
            self.check_cancel()?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use crate::storage::database::{Cluster, CreateIndex, CreateRelation, Database, Session};
    use crate::storage::heapam::HeapRelation;
    use crate::storage::index::KeySpec;
    use crate::storage::options::ClusterOptions;
    use crate::types::{ItemPointer, RelId, RoleId};

    /// In-memory cluster with database `app` and table `t`, 1 KiB pages.
    pub(crate) struct Fixture {
        pub(crate) cluster: Cluster,
        pub(crate) db: Arc<Database>,
        pub(crate) session: Session,
        pub(crate) rel: RelId,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let cluster =
                Cluster::in_memory(ClusterOptions::default().page_size(1024).first_xid(1_000))
                    .unwrap();
            let db = cluster.create_database("app", RoleId(10)).unwrap();
            let session = cluster.session(RoleId(10), true);
            let rel = db
                .create_relation(&session, CreateRelation::table("t"))
                .unwrap();
            Self {
                cluster,
                db,
                session,
                rel,
            }
        }

        pub(crate) fn heap(&self) -> Arc<HeapRelation> {
            self.db.relation(self.rel).unwrap()
        }

        pub(crate) fn create_index(&self) -> RelId {
            self.db
                .create_index(
                    &self.session,
                    self.rel,
                    CreateIndex {
                        name: "t_key".into(),
                        key: KeySpec { offset: 0, len: 8 },
                        predicate: None,
                        primary: true,
                    },
                )
                .unwrap()
        }

        /// 32-byte rows keyed by their sequence number, in one transaction.
        pub(crate) fn insert_rows(&self, n: usize) -> Vec<ItemPointer> {
            let tx = self.db.begin(&self.session);
            let tids = (0..n)
                .map(|i| tx.insert(self.rel, &row(i)).unwrap())
                .collect();
            tx.commit().unwrap();
            tids
        }

        pub(crate) fn delete_rows(&self, tids: &[ItemPointer]) {
            let tx = self.db.begin(&self.session);
            for tid in tids {
                tx.delete(self.rel, *tid).unwrap();
            }
            tx.commit().unwrap();
        }

        pub(crate) fn update_row(&self, tid: ItemPointer, i: usize) -> ItemPointer {
            let tx = self.db.begin(&self.session);
            let new_tid = tx.update(self.rel, tid, &row(i)).unwrap();
            tx.commit().unwrap();
            new_tid
        }

        pub(crate) fn live_rows(&self) -> usize {
            self.heap().committed_rows(self.db.xact()).unwrap().len()
        }
    }

    pub(crate) fn row(i: usize) -> Vec<u8> {
        let mut bytes = (i as u64).to_be_bytes().to_vec();
        bytes.resize(32, b'x');
        bytes
    }
}
