#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use heapvac::storage::{
    Cluster, ClusterOptions, CreateIndex, CreateRelation, Database, HeapRelation, KeySpec,
};
use heapvac::types::{ItemPointer, RelId, RoleId};
use heapvac::vacuum::{vacuum, VacuumConfig, VacuumOptions, VacuumReport};
use proptest::prelude::*;

const ROW_WIDTH: usize = 32;

#[derive(Clone, Debug)]
struct Workload {
    rows: usize,
    deletes: Vec<bool>,
    updates: Vec<bool>,
    full: bool,
    with_index: bool,
}

fn workload() -> impl Strategy<Value = Workload> {
    (1usize..120).prop_flat_map(|rows| {
        (
            Just(rows),
            prop::collection::vec(any::<bool>(), rows),
            prop::collection::vec(prop::bool::weighted(0.2), rows),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(rows, deletes, updates, full, with_index)| Workload {
                rows,
                deletes,
                updates,
                full,
                with_index,
            })
    })
}

struct Loaded {
    cluster: Cluster,
    db: Arc<Database>,
    rel: RelId,
}

impl Loaded {
    fn heap(&self) -> Arc<HeapRelation> {
        self.db.relation(self.rel).expect("heap")
    }

    fn live(&self) -> Vec<(ItemPointer, Vec<u8>)> {
        self.heap()
            .committed_rows(self.db.xact())
            .expect("committed rows")
    }

    fn run(&self, full: bool) -> VacuumReport {
        let session = self.cluster.session(RoleId(10), true);
        let options = if full {
            VacuumOptions::full()
        } else {
            VacuumOptions::lazy()
        };
        vacuum(
            &self.cluster,
            &self.db,
            &session,
            &options.relation("t"),
            &VacuumConfig::default(),
        )
        .expect("vacuum")
    }

    /// Every used slot of the heap with its header.
    fn versions(&self) -> Vec<(ItemPointer, heapvac::storage::TupleHeader)> {
        let heap = self.heap();
        let mut out = Vec::new();
        for block in 0..heap.file().nblocks() {
            for slot in 1..=64 {
                let tid = ItemPointer::new(block, slot);
                if let Some((header, _)) = heap.fetch(tid).expect("fetch") {
                    out.push((tid, header));
                }
            }
        }
        out
    }
}

fn load(w: &Workload) -> Loaded {
    let cluster =
        Cluster::in_memory(ClusterOptions::default().page_size(1024)).expect("cluster");
    let db = cluster.create_database("app", RoleId(10)).expect("database");
    let session = cluster.session(RoleId(10), true);
    let rel = db
        .create_relation(&session, CreateRelation::table("t"))
        .expect("table");
    if w.with_index {
        db.create_index(
            &session,
            rel,
            CreateIndex {
                name: "t_pkey".into(),
                key: KeySpec { offset: 0, len: 8 },
                predicate: None,
                primary: true,
            },
        )
        .expect("index");
    }
    let tx = db.begin(&session);
    let tids: Vec<_> = (0..w.rows)
        .map(|key| tx.insert(rel, &row(key as u64, b'a')).expect("insert"))
        .collect();
    tx.commit().expect("commit");

    let tx = db.begin(&session);
    for (key, tid) in tids.iter().enumerate() {
        if w.deletes[key] {
            tx.delete(rel, *tid).expect("delete");
        } else if w.updates[key] {
            tx.update(rel, *tid, &row(key as u64, b'b')).expect("update");
        }
    }
    tx.commit().expect("commit");
    Loaded { cluster, db, rel }
}

fn row(key: u64, fill: u8) -> Vec<u8> {
    let mut bytes = key.to_be_bytes().to_vec();
    bytes.resize(ROW_WIDTH, fill);
    bytes
}

fn payloads(rows: &[(ItemPointer, Vec<u8>)]) -> Vec<Vec<u8>> {
    let mut out: Vec<_> = rows.iter().map(|(_, p)| p.clone()).collect();
    out.sort();
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn live_rows_are_conserved_and_second_run_is_a_no_op(w in workload()) {
        let loaded = load(&w);
        let before = payloads(&loaded.live());

        let first = loaded.run(w.full);
        let after_first = loaded.live();
        prop_assert_eq!(payloads(&after_first), before.clone());
        let rel = first.relation(loaded.rel).expect("report entry");
        prop_assert_eq!(rel.kept as usize, before.len());

        let second = loaded.run(w.full);
        let rel = second.relation(loaded.rel).expect("report entry");
        prop_assert_eq!(rel.removed, 0);
        prop_assert_eq!(rel.moved, 0);
        prop_assert_eq!(loaded.live(), after_first);
    }

    #[test]
    fn truncation_keeps_every_live_page(w in workload()) {
        let loaded = load(&w);
        loaded.run(w.full);
        let nblocks = loaded.heap().file().nblocks();
        for (tid, _) in loaded.live() {
            prop_assert!(tid.block < nblocks);
        }
    }

    #[test]
    fn index_matches_heap_after_vacuum(mut w in workload()) {
        w.with_index = true;
        let loaded = load(&w);
        loaded.run(w.full);
        let live: BTreeSet<ItemPointer> = loaded.live().into_iter().map(|(tid, _)| tid).collect();
        let heap = loaded.heap();
        let indexed: BTreeSet<ItemPointer> = heap.indexes()[0].tids().into_iter().collect();
        prop_assert_eq!(indexed, live);
    }

    #[test]
    fn relocated_chains_stay_resolvable(mut w in workload()) {
        w.full = true;
        let loaded = load(&w);
        // A transaction older than the updates keeps superseded versions
        // visible, so full compaction has to move whole chains.
        let reader = loaded.cluster.session(RoleId(10), true);
        let xid = loaded.db.xact().begin(reader.id());
        let more = w.rows as u64;
        let session = loaded.cluster.session(RoleId(10), true);
        let tx = loaded.db.begin(&session);
        let doomed: Vec<_> = loaded.live().into_iter().take(w.rows / 2).collect();
        for (i, (tid, _)) in doomed.iter().enumerate() {
            tx.update(loaded.rel, *tid, &row(more + i as u64, b'c')).expect("update");
        }
        tx.commit().expect("commit");
        let before = payloads(&loaded.live());

        loaded.run(true);
        loaded.db.xact().abort(xid);

        prop_assert_eq!(payloads(&loaded.live()), before);
        let versions = loaded.versions();
        let present: BTreeSet<ItemPointer> = versions.iter().map(|(tid, _)| *tid).collect();
        for (tid, header) in &versions {
            if header.ctid != *tid && header.ctid.is_valid() {
                prop_assert!(present.contains(&header.ctid), "dangling link {} -> {}", tid, header.ctid);
            }
        }
        for (tid, _) in loaded.live() {
            let (header, _) = loaded.heap().fetch(tid).expect("fetch").expect("live row");
            prop_assert_eq!(header.ctid, tid);
        }
    }
}
