#![allow(missing_docs)]

use std::sync::Arc;

use heapvac::storage::{
    Cluster, ClusterOptions, CreateIndex, CreateRelation, Database, HeapRelation, InfoMask,
    KeySpec,
};
use heapvac::types::{ItemPointer, RelId, Result, RoleId, Xid};
use heapvac::vacuum::{vacuum, VacuumConfig, VacuumOptions, VacuumReport, WarningKind};

/// Five 160-byte rows fill a 1 KiB page.
const WIDE_ROW: usize = 160;

struct Harness {
    cluster: Cluster,
    db: Arc<Database>,
    rel: RelId,
}

impl Harness {
    fn new(page_size: usize) -> Result<Self> {
        let cluster = Cluster::in_memory(ClusterOptions::default().page_size(page_size))?;
        let db = cluster.create_database("app", RoleId(10))?;
        let session = cluster.session(RoleId(10), true);
        let rel = db.create_relation(&session, CreateRelation::table("items"))?;
        Ok(Self { cluster, db, rel })
    }

    fn with_index(self) -> Result<Self> {
        let session = self.cluster.session(RoleId(10), true);
        self.db.create_index(
            &session,
            self.rel,
            CreateIndex {
                name: "items_pkey".into(),
                key: KeySpec { offset: 0, len: 8 },
                predicate: None,
                primary: true,
            },
        )?;
        Ok(self)
    }

    fn heap(&self) -> Arc<HeapRelation> {
        self.db.relation(self.rel).expect("heap")
    }

    fn insert(&self, keys: std::ops::Range<u64>, width: usize) -> Result<Vec<ItemPointer>> {
        let session = self.cluster.session(RoleId(10), true);
        let tx = self.db.begin(&session);
        let mut tids = Vec::new();
        for key in keys {
            tids.push(tx.insert(self.rel, &row(key, width, b'a'))?);
        }
        tx.commit()?;
        Ok(tids)
    }

    fn delete(&self, tids: &[ItemPointer]) -> Result<()> {
        let session = self.cluster.session(RoleId(10), true);
        let tx = self.db.begin(&session);
        for tid in tids {
            tx.delete(self.rel, *tid)?;
        }
        tx.commit()
    }

    fn update(&self, tid: ItemPointer, key: u64, width: usize, fill: u8) -> Result<ItemPointer> {
        let session = self.cluster.session(RoleId(10), true);
        let tx = self.db.begin(&session);
        let new_tid = tx.update(self.rel, tid, &row(key, width, fill))?;
        tx.commit()?;
        Ok(new_tid)
    }

    fn vacuum(&self, options: VacuumOptions) -> Result<VacuumReport> {
        self.vacuum_with(options, &VacuumConfig::default())
    }

    fn vacuum_with(&self, options: VacuumOptions, config: &VacuumConfig) -> Result<VacuumReport> {
        let session = self.cluster.session(RoleId(10), true);
        vacuum(&self.cluster, &self.db, &session, &options, config)
    }

    fn live(&self) -> Result<Vec<Vec<u8>>> {
        let mut rows: Vec<Vec<u8>> = self
            .heap()
            .committed_rows(self.db.xact())?
            .into_iter()
            .map(|(_, payload)| payload)
            .collect();
        rows.sort();
        Ok(rows)
    }
}

fn row(key: u64, width: usize, fill: u8) -> Vec<u8> {
    let mut bytes = key.to_be_bytes().to_vec();
    bytes.resize(width, fill);
    bytes
}

#[test]
fn full_vacuum_empties_middle_page_and_relocates_tail_row() -> Result<()> {
    let h = Harness::new(1024)?;
    let tids = h.insert(0..15, WIDE_ROW)?;
    assert_eq!(h.heap().file().nblocks(), 3);
    // A: rows 0-4 keep two; B: rows 5-9 all dead; C: rows 10-14 keep one.
    let mut doomed = tids[2..5].to_vec();
    doomed.extend_from_slice(&tids[5..10]);
    doomed.extend_from_slice(&tids[10..14]);
    h.delete(&doomed)?;
    let before = h.live()?;

    let report = h.vacuum(VacuumOptions::full().relation("items"))?;
    let rel = report.relation(h.rel).expect("report entry");
    assert_eq!(rel.pages_before, 3);
    assert_eq!(rel.removed, 12);
    assert_eq!(rel.kept, 3);
    assert_eq!(rel.moved, 1);
    assert_eq!(rel.pages_after, 1);
    assert_eq!(h.heap().file().nblocks(), 1);
    assert_eq!(h.live()?, before);
    assert_eq!(before.len(), 3);
    Ok(())
}

#[test]
fn superseded_chain_members_are_reaped_not_moved() -> Result<()> {
    let h = Harness::new(1024)?;
    let tids = h.insert(0..5, WIDE_ROW)?;
    let v2 = h.update(tids[0], 0, WIDE_ROW, b'b')?;
    let v3 = h.update(v2, 0, WIDE_ROW, b'c')?;
    assert_eq!(v3.block, 1);

    let report = h.vacuum(VacuumOptions::full().relation("items"))?;
    let rel = report.relation(h.rel).expect("report entry");
    assert_eq!(rel.removed, 2);
    assert_eq!(rel.moved, 1);
    assert_eq!(rel.pages_after, 1);

    let rows = h.heap().committed_rows(h.db.xact())?;
    assert_eq!(rows.len(), 5);
    let newest = rows
        .iter()
        .find(|(_, payload)| payload[..8] == 0u64.to_be_bytes())
        .expect("key 0 survives");
    assert_eq!(newest.1, row(0, WIDE_ROW, b'c'));
    let (header, _) = h.heap().fetch(newest.0)?.expect("newest version");
    assert_eq!(header.ctid, newest.0);
    Ok(())
}

#[test]
fn visible_update_chain_moves_whole_into_freed_space() -> Result<()> {
    let h = Harness::new(1024)?.with_index()?;
    let tids = h.insert(0..5, WIDE_ROW)?;
    h.delete(&tids[..4])?;
    let head = h.insert(7..8, WIDE_ROW)?[0];
    assert_eq!(head.block, 1);
    // An open snapshot older than both updates keeps every version visible.
    let reader = h.cluster.session(RoleId(10), true);
    let xid = h.db.xact().begin(reader.id());
    let second = h.update(head, 7, WIDE_ROW, b'b')?;
    h.update(second, 7, WIDE_ROW, b'c')?;

    let report = h.vacuum(VacuumOptions::full().relation("items"))?;
    h.db.xact().abort(xid);
    let rel = report.relation(h.rel).expect("report entry");
    assert_eq!(rel.removed, 4);
    assert_eq!(rel.moved, 3);
    assert_eq!(rel.pages_after, 1);
    assert_eq!(h.heap().file().nblocks(), 1);
    assert_eq!(report.warnings_of(WarningKind::ChainAbandoned).count(), 0);
    assert_eq!(report.warnings_of(WarningKind::IndexCountMismatch).count(), 0);

    let heap = h.heap();
    let mut start = None;
    for slot in 1..=8 {
        let tid = ItemPointer::new(0, slot);
        if let Some((_, payload)) = heap.fetch(tid)? {
            if payload == row(7, WIDE_ROW, b'a') {
                start = Some(tid);
            }
        }
    }
    let mut tid = start.expect("chain head on page 0");
    let mut fills = Vec::new();
    let mut prev_xmax = None;
    loop {
        let (header, payload) = heap.fetch(tid)?.expect("chain member");
        assert_eq!(tid.block, 0);
        if let Some(xmax) = prev_xmax {
            assert_eq!(header.xmin, xmax);
        }
        fills.push(payload[WIDE_ROW - 1]);
        if header.ctid == tid {
            assert!(header.infomask.contains(InfoMask::UPDATED));
            break;
        }
        prev_xmax = Some(header.xmax);
        tid = header.ctid;
    }
    assert_eq!(fills, b"abc".to_vec());
    assert_eq!(h.live()?, vec![row(4, WIDE_ROW, b'a'), row(7, WIDE_ROW, b'c')]);
    Ok(())
}

#[test]
fn in_progress_deleter_limits_pass_to_reaping() -> Result<()> {
    let h = Harness::new(1024)?;
    let tids = h.insert(0..15, WIDE_ROW)?;
    h.delete(&tids[0..4])?;
    let other = h.cluster.session(RoleId(10), true);
    let xid = h.db.xact().begin(other.id());
    h.heap().delete(h.db.heap_context(), xid, tids[14])?;

    let report = h.vacuum(VacuumOptions::full().relation("items"))?;
    h.db.xact().abort(xid);
    let rel = report.relation(h.rel).expect("report entry");
    assert!(!rel.shrinkable);
    assert_eq!(rel.moved, 0);
    assert_eq!(rel.removed, 4);
    assert_eq!(rel.pages_after, 3);
    assert_eq!(report.warnings_of(WarningKind::CannotShrink).count(), 1);
    assert_eq!(h.live()?.len(), 11);
    Ok(())
}

#[test]
fn lazy_vacuum_runs_several_index_cycles_and_truncates_tail() -> Result<()> {
    let h = Harness::new(1024)?.with_index()?;
    let tids = h.insert(0..400, 32)?;
    h.delete(&tids[100..])?;
    let config = VacuumConfig {
        vacuum_mem_kb: 0,
        ..VacuumConfig::default()
    };

    let report = h.vacuum_with(VacuumOptions::lazy().relation("items"), &config)?;
    let rel = report.relation(h.rel).expect("report entry");
    assert_eq!(rel.removed, 300);
    assert_eq!(rel.moved, 0);
    assert!(rel.index_scans > 1);
    assert!(rel.pages_after < rel.pages_before);
    let live = h.live()?;
    assert_eq!(live.len(), 100);
    let index = &h.heap().indexes()[0];
    assert_eq!(index.tids().len(), 100);
    let max_live_block = h
        .heap()
        .committed_rows(h.db.xact())?
        .iter()
        .map(|(tid, _)| tid.block)
        .max()
        .expect("rows");
    assert_eq!(h.heap().file().nblocks(), max_live_block + 1);
    Ok(())
}

#[test]
fn freeze_replaces_old_creator_ids() -> Result<()> {
    let h = Harness::new(1024)?;
    let tids = h.insert(0..20, 32)?;
    let report = h.vacuum(VacuumOptions::lazy().relation("items").freeze(true))?;
    let rel = report.relation(h.rel).expect("report entry");
    assert_eq!(rel.frozen, 20);
    for tid in tids {
        let (header, _) = h.heap().fetch(tid)?.expect("row");
        assert_eq!(header.xmin, Xid::FROZEN);
    }
    assert_eq!(h.live()?.len(), 20);

    let again = h.vacuum(VacuumOptions::lazy().relation("items").freeze(true))?;
    assert_eq!(again.relation(h.rel).expect("report entry").frozen, 0);
    Ok(())
}

#[test]
fn database_wide_runs_never_move_watermarks_backward() -> Result<()> {
    let h = Harness::new(1024)?;
    let mut previous = h.cluster.database_stats().get(h.db.id()).expect("row");
    for round in 0..4u64 {
        let tids = h.insert(round * 10..round * 10 + 10, 32)?;
        h.delete(&tids[..5])?;
        let report = h.vacuum(VacuumOptions::lazy())?;
        assert!(report.database_wide);
        let current = h.cluster.database_stats().get(h.db.id()).expect("row");
        assert!(current.vacuum_xid.follows_or_equals(previous.vacuum_xid));
        assert!(current.frozen_xid.follows_or_equals(previous.frozen_xid));
        previous = current;
    }
    assert!(h.cluster.xact().oldest_retained().follows(Xid::FIRST_NORMAL));
    Ok(())
}

#[test]
fn analyze_flag_marks_vacuumed_relations() -> Result<()> {
    let h = Harness::new(1024)?;
    h.insert(0..4, 32)?;
    let report = h.vacuum(VacuumOptions::lazy().analyze(true))?;
    let rel = report.relation(h.rel).expect("report entry");
    assert!(rel.analyzed);
    Ok(())
}
