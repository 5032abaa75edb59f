#![forbid(unsafe_code)]

//! Lazy vacuum: reaps dead versions in place under a lock that lets readers
//! and writers continue. Nothing moves; the tail is truncated only when a
//! conditional exclusive lock is free and enough pages would be released.

use std::sync::Arc;

use tracing::debug;

use crate::primitives::concurrency::LockMode;
use crate::storage::heapam::log_heap_write;
use crate::storage::index::IndexAccessMethod;
use crate::storage::page::ITEM_ID_LEN;
use crate::storage::tuple::TUPLE_HEADER_LEN;
use crate::types::{max_align, BlockNumber, ItemPointer, Result, SlotNo};
use crate::vacuum::fsm::FreeSpaceCollector;
use crate::vacuum::index::{bulk_delete, cleanup_index};
use crate::vacuum::page_ops::{classify_slot, vacuum_page};
use crate::vacuum::repair::truncate_heap;
use crate::vacuum::report::{Diagnostics, RelationReport, WarningKind};
use crate::vacuum::stats::update_relstats;
use crate::vacuum::visibility::HtsvResult;
use crate::vacuum::RelationPass;

/// Most versions one page of `page_size` bytes can hold.
pub(crate) fn max_tuples_per_page(page_size: usize) -> usize {
    page_size / (max_align(TUPLE_HEADER_LEN) + ITEM_ID_LEN)
}

/// On-disk size of one row location: block number plus slot number.
const TID_BYTES: usize = 6;

/// Capacity of the dead-location array for a memory budget in KiB.
pub(crate) fn dead_tuple_capacity(vacuum_mem_kb: usize, page_size: usize) -> usize {
    let fits = vacuum_mem_kb.saturating_mul(1024) / TID_BYTES;
    fits.max(max_tuples_per_page(page_size))
}

struct LazyState {
    dead: Vec<ItemPointer>,
    max_dead: usize,
    free: FreeSpaceCollector,
    nonempty_pages: BlockNumber,
}

pub(crate) fn lazy_vacuum_rel(
    pass: &RelationPass<'_>,
    diag: &mut Diagnostics,
    report: &mut RelationReport,
) -> Result<()> {
    let file = pass.file();
    let rel = pass.rel();
    let page_size = file.page_size();
    let nblocks = file.nblocks();
    let indexes = pass.heap.indexes();
    let per_page = max_tuples_per_page(page_size);
    let mut state = LazyState {
        dead: Vec::new(),
        max_dead: dead_tuple_capacity(pass.config.vacuum_mem_kb, page_size),
        free: FreeSpaceCollector::new(pass.config.max_fsm_pages, pass.fsm().avg_request_size(rel)),
        nonempty_pages: 0,
    };
    report.pages_before = nblocks;

    for blkno in 0..nblocks {
        pass.delay_point()?;
        if state.max_dead - state.dead.len() < per_page && !state.dead.is_empty() {
            vacuum_cycle(pass, &indexes, &mut state, diag, report)?;
        }

        let frame = file.buffer(blkno)?;
        let mut page = frame.write();
        if page.is_new() {
            diag.warn(
                WarningKind::UninitializedPage,
                Some(pass.relname),
                format!("relation \"{}\" page {blkno} is uninitialized --- fixing", pass.relname),
            );
            page.init();
            log_heap_write(pass.wal(), rel, &frame, &mut page)?;
            report.empty_pages += 1;
            state.free.record(blkno, page.free_space());
            continue;
        }
        if page.is_empty() {
            report.empty_pages += 1;
            state.free.record(blkno, page.free_space());
            continue;
        }

        let prev_dead = state.dead.len();
        let mut changed = false;
        let mut hastup = false;
        let slots: Vec<SlotNo> = page.slot_numbers().collect();
        for slot in slots {
            if !page.is_used(slot) {
                report.unused += 1;
                continue;
            }
            let verdict = classify_slot(&mut page, slot, &pass.limits, pass.xact())?;
            changed |= verdict.changed;
            match verdict.result {
                HtsvResult::Dead => {
                    state.dead.push(ItemPointer::new(blkno, slot));
                    report.removed += 1;
                    continue;
                }
                HtsvResult::Live => {
                    if verdict.frozen {
                        report.frozen += 1;
                    }
                }
                HtsvResult::RecentlyDead => report.recently_dead += 1,
                HtsvResult::InsertInProgress | HtsvResult::DeleteInProgress => {
                    report.shrinkable = false;
                }
            }
            report.kept += 1;
            hastup = true;
        }
        if state.dead.len() == prev_dead {
            state.free.record(blkno, page.free_space());
        }
        if hastup {
            state.nonempty_pages = blkno + 1;
        }
        if changed {
            log_heap_write(pass.wal(), rel, &frame, &mut page)?;
        }
    }

    if !state.dead.is_empty() {
        vacuum_cycle(pass, &indexes, &mut state, diag, report)?;
    } else {
        for index in &indexes {
            cleanup_index(pass, index.as_ref(), None, None, diag, report)?;
        }
    }
    diag.detail(
        pass.relname,
        &format!(
            "found {} removable, {} nonremovable row versions in {nblocks} pages; \
             {} dead row versions cannot be removed yet; \
             there were {} unused item pointers; \
             {} pages are entirely empty",
            report.removed, report.kept, report.recently_dead, report.unused, report.empty_pages,
        ),
    );

    let rel_pages = finish_heap(pass, nblocks, state.nonempty_pages, diag)?;
    report.pages_after = rel_pages;

    let entries = state.free.into_entries(rel_pages);
    debug!(rel = rel.0, published = entries.len(), "vacuum.fsm.published");
    pass.fsm().record_relation_free_space(rel, entries);
    update_relstats(pass, rel_pages, report.kept, !indexes.is_empty());
    debug!(
        rel = rel.0,
        pages = rel_pages,
        removed = report.removed,
        index_scans = report.index_scans,
        "vacuum.rel.lazy"
    );
    Ok(())
}

/// Removes the collected locations from every index, then from the heap.
fn vacuum_cycle(
    pass: &RelationPass<'_>,
    indexes: &[Arc<dyn IndexAccessMethod>],
    state: &mut LazyState,
    diag: &mut Diagnostics,
    report: &mut RelationReport,
) -> Result<()> {
    for index in indexes {
        let dead = &state.dead;
        let prior = bulk_delete(index.as_ref(), &|tid| dead.binary_search(&tid).is_ok())?;
        cleanup_index(pass, index.as_ref(), Some(prior), None, diag, report)?;
    }
    lazy_vacuum_heap(pass, state, diag)?;
    state.dead.clear();
    report.index_scans += 1;
    Ok(())
}

fn lazy_vacuum_heap(pass: &RelationPass<'_>, state: &mut LazyState, diag: &Diagnostics) -> Result<()> {
    let file = pass.file();
    let mut npages = 0usize;
    let mut rest = state.dead.as_slice();
    while let Some(first) = rest.first() {
        pass.delay_point()?;
        let block = first.block;
        let split = rest.iter().position(|tid| tid.block != block).unwrap_or(rest.len());
        let offsets: Vec<SlotNo> = rest[..split].iter().map(|tid| tid.slot).collect();
        rest = &rest[split..];

        let frame = file.buffer(block)?;
        let mut page = frame.write();
        vacuum_page(pass.wal(), pass.rel(), &frame, &mut page, &offsets)?;
        state.free.record(block, page.free_space());
        npages += 1;
    }
    diag.detail(
        pass.relname,
        &format!("removed {} row versions in {npages} pages", state.dead.len()),
    );
    Ok(())
}

/// Truncates the empty tail if the exclusive lock is free right now.
/// Returns the page count to record.
/// Truncates the empty tail when enough pages would be released, then
/// writes the log and every dirty page back whatever the outcome.
fn finish_heap(
    pass: &RelationPass<'_>,
    nblocks: BlockNumber,
    nonempty_pages: BlockNumber,
    diag: &Diagnostics,
) -> Result<BlockNumber> {
    let mut rel_pages = nblocks;
    let possibly_freeable = nblocks - nonempty_pages;
    let fraction = pass.config.rel_truncate_fraction.max(1);
    if possibly_freeable > 0
        && (possibly_freeable >= pass.config.rel_truncate_minimum
            || possibly_freeable >= nblocks / fraction)
    {
        rel_pages = lazy_truncate_heap(pass, nblocks, nonempty_pages, diag)?;
    }
    pass.wal().flush()?;
    pass.file().flush()?;
    Ok(rel_pages)
}

fn lazy_truncate_heap(
    pass: &RelationPass<'_>,
    old_rel_pages: BlockNumber,
    nonempty_pages: BlockNumber,
    diag: &Diagnostics,
) -> Result<BlockNumber> {
    if !pass.tx.try_lock_relation(pass.rel(), LockMode::AccessExclusive) {
        debug!(rel = pass.rel().0, "vacuum.rel.truncate_skipped");
        return Ok(old_rel_pages);
    }
    let current = pass.file().nblocks();
    if current != old_rel_pages {
        return Ok(current);
    }
    let new_rel_pages = count_nondeletable_pages(pass, old_rel_pages, nonempty_pages)?;
    if new_rel_pages >= old_rel_pages {
        return Ok(old_rel_pages);
    }
    pass.wal().flush()?;
    pass.file().flush()?;
    let after = truncate_heap(pass, new_rel_pages)?;
    diag.detail(
        pass.relname,
        &format!("truncated {old_rel_pages} to {after} pages"),
    );
    Ok(after)
}

/// Rescans the tail backward for the last page holding any used slot.
fn count_nondeletable_pages(
    pass: &RelationPass<'_>,
    rel_pages: BlockNumber,
    nonempty_pages: BlockNumber,
) -> Result<BlockNumber> {
    let file = pass.file();
    let mut blkno = rel_pages;
    while blkno > nonempty_pages {
        pass.delay_point()?;
        blkno -= 1;
        let frame = file.buffer(blkno)?;
        let page = frame.read();
        if page.is_new() || page.is_empty() {
            continue;
        }
        if page.slot_numbers().any(|slot| page.is_used(slot)) {
            return Ok(blkno + 1);
        }
    }
    Ok(nonempty_pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vacuum::options::{VacuumConfig, VacuumOptions};
    use crate::vacuum::report::RelationOutcome;
    use crate::vacuum::testutil::Fixture;
    use crate::vacuum::vacuum;

    #[test]
    fn capacity_never_drops_below_one_page() {
        assert_eq!(max_tuples_per_page(1024), 1024 / 28);
        assert_eq!(dead_tuple_capacity(0, 1024), max_tuples_per_page(1024));
        assert_eq!(dead_tuple_capacity(6, 8192), 1024);
    }

    #[test]
    fn lazy_reaps_without_moving() {
        let fx = Fixture::new();
        let tids = fx.insert_rows(60);
        fx.delete_rows(&tids[..30]);
        let before = fx.heap().file().nblocks();
        let report = vacuum(
            &fx.cluster,
            &fx.db,
            &fx.session,
            &VacuumOptions::lazy().relation("t"),
            &VacuumConfig::default(),
        )
        .unwrap();
        let rel = report.relation(fx.rel).unwrap();
        assert_eq!(rel.outcome, RelationOutcome::Vacuumed);
        assert_eq!(rel.removed, 30);
        assert_eq!(rel.kept, 30);
        assert_eq!(rel.moved, 0);
        assert_eq!(rel.index_scans, 1);
        assert!(rel.pages_after <= before);
        assert_eq!(fx.live_rows(), 30);
        for tid in &tids[30..] {
            assert!(fx.heap().fetch(*tid).unwrap().is_some());
        }
    }

    #[test]
    fn small_budget_runs_several_index_cycles() {
        let fx = Fixture::new();
        fx.create_index();
        let tids = fx.insert_rows(300);
        fx.delete_rows(&tids);
        let config = VacuumConfig {
            vacuum_mem_kb: 0,
            ..VacuumConfig::default()
        };
        let report = vacuum(
            &fx.cluster,
            &fx.db,
            &fx.session,
            &VacuumOptions::lazy().relation("t"),
            &config,
        )
        .unwrap();
        let rel = report.relation(fx.rel).unwrap();
        assert!(rel.index_scans > 1, "index scans: {}", rel.index_scans);
        assert_eq!(rel.removed, 300);
        assert_eq!(rel.indexes[0].result.num_index_tuples, 0);
        assert_eq!(rel.pages_after, 0);
    }

    #[test]
    fn truncation_gives_up_when_a_writer_holds_the_table() {
        let fx = Fixture::new();
        let tids = fx.insert_rows(120);
        fx.delete_rows(&tids[40..]);
        let other = fx.cluster.session(crate::types::RoleId(10), true);
        let writer = fx.db.begin(&other);
        writer
            .lock_relation(fx.rel, LockMode::RowExclusive)
            .unwrap();
        let before = fx.heap().file().nblocks();
        let report = vacuum(
            &fx.cluster,
            &fx.db,
            &fx.session,
            &VacuumOptions::lazy().relation("t"),
            &VacuumConfig::default(),
        )
        .unwrap();
        writer.abort();
        let rel = report.relation(fx.rel).unwrap();
        assert_eq!(rel.removed, 80);
        assert_eq!(rel.pages_after, before);
        assert_eq!(fx.heap().file().nblocks(), before);
    }

    #[test]
    fn relation_grown_during_scan_is_still_written_back() {
        let fx = Fixture::new();
        let tids = fx.insert_rows(120);
        fx.delete_rows(&tids[40..]);
        let heap = fx.heap();
        let scanned = heap.file().nblocks();
        // A concurrent inserter extended the table after the scan.
        heap.file().extend().unwrap();
        heap.file().buffer(0).unwrap().mark_dirty();

        let tx = fx.db.begin(&fx.session);
        let config = VacuumConfig::default();
        let limits =
            crate::vacuum::compute_limits(fx.db.xact(), tx.xid(), false, config.freeze_min_age)
                .limits;
        let pass = RelationPass {
            tx: &tx,
            heap: &heap,
            limits,
            config: &config,
            relname: "t",
            cost: crate::vacuum::cost::CostBalance::new(&config, heap.file().usage()),
        };
        let pages = finish_heap(&pass, scanned, 1, &Diagnostics::new(false)).unwrap();
        assert_eq!(pages, scanned + 1);
        assert_eq!(heap.file().nblocks(), scanned + 1);
        assert_eq!(heap.file().flush().unwrap(), 0);
        tx.abort();
    }
}
