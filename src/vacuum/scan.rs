#![forbid(unsafe_code)]

//! First pass of a full vacuum: classify every row version and build the
//! reapable and target page lists.

use tracing::debug;

use crate::storage::heapam::log_heap_write;
use crate::storage::page::HeapPage;
use crate::types::{BlockNumber, ItemPointer, Result};
use crate::vacuum::page_ops::classify_slot;
use crate::vacuum::pagelist::{VacPage, VacPageList, VtLinks};
use crate::vacuum::report::{Diagnostics, WarningKind};
use crate::vacuum::visibility::HtsvResult;
use crate::vacuum::RelationPass;

/// Everything the compactor needs to know about the heap.
#[derive(Debug)]
pub(crate) struct HeapScan {
    pub(crate) pages: VacPageList,
    pub(crate) vtlinks: VtLinks,
    pub(crate) nblocks: BlockNumber,
    pub(crate) num_tuples: u64,
    pub(crate) tups_vacuumed: u64,
    pub(crate) nkeep: u64,
    pub(crate) nunused: u64,
    pub(crate) frozen: u64,
    pub(crate) empty_pages: u64,
    pub(crate) min_tlen: usize,
    pub(crate) max_tlen: usize,
    pub(crate) free_size: usize,
    pub(crate) usable_free_size: usize,
    pub(crate) shrinkable: bool,
}

impl HeapScan {
    fn new(nblocks: BlockNumber, page_size: usize) -> Self {
        Self {
            pages: VacPageList::default(),
            vtlinks: VtLinks::default(),
            nblocks,
            num_tuples: 0,
            tups_vacuumed: 0,
            nkeep: 0,
            nunused: 0,
            frozen: 0,
            empty_pages: 0,
            min_tlen: page_size,
            max_tlen: 0,
            free_size: 0,
            usable_free_size: 0,
            shrinkable: true,
        }
    }
}

/// Scans the relation under its exclusive lock.
pub(crate) fn scan_heap(pass: &RelationPass<'_>, diag: &mut Diagnostics) -> Result<HeapScan> {
    let file = pass.file();
    let rel = pass.rel();
    let page_size = file.page_size();
    let nblocks = file.nblocks();
    let mut scan = HeapScan::new(nblocks, page_size);
    let mut empty_end_pages: BlockNumber = 0;

    for blkno in 0..nblocks {
        pass.delay_point()?;
        let frame = file.buffer(blkno)?;
        let mut page = frame.write();
        let mut vacpage = VacPage::new(blkno);

        if page.is_new() {
            diag.warn(
                WarningKind::UninitializedPage,
                Some(pass.relname),
                format!("relation \"{}\" page {blkno} is uninitialized --- fixing", pass.relname),
            );
            page.init();
            log_heap_write(pass.wal(), rel, &frame, &mut page)?;
            vacpage.free = page.raw_free_space();
            scan.free_size += vacpage.free;
            scan.empty_pages += 1;
            empty_end_pages += 1;
            scan.pages.insert(vacpage, true, true);
            continue;
        }
        if page.is_empty() {
            vacpage.free = page.raw_free_space();
            scan.free_size += vacpage.free;
            scan.empty_pages += 1;
            empty_end_pages += 1;
            scan.pages.insert(vacpage, true, true);
            continue;
        }

        let mut changed = false;
        let mut notup = true;
        let mut temp: Option<HeapPage> = None;
        let slots: Vec<_> = page.slot_numbers().collect();
        for slot in slots {
            if !page.is_used(slot) {
                vacpage.offsets.push(slot);
                scan.nunused += 1;
                continue;
            }
            let tid = ItemPointer::new(blkno, slot);
            let verdict = classify_slot(&mut page, slot, &pass.limits, pass.xact())?;
            changed |= verdict.changed;
            let mut gone = false;
            match verdict.result {
                HtsvResult::Dead => gone = true,
                HtsvResult::Live => {
                    if verdict.frozen {
                        scan.frozen += 1;
                    }
                }
                HtsvResult::RecentlyDead => {
                    scan.nkeep += 1;
                    if scan.shrinkable && !verdict.header.is_chain_tail_at(tid) {
                        scan.vtlinks.push(verdict.header.ctid, tid);
                    }
                }
                HtsvResult::InsertInProgress | HtsvResult::DeleteInProgress => {
                    if scan.shrinkable {
                        let what = if verdict.result == HtsvResult::InsertInProgress {
                            "insert"
                        } else {
                            "delete"
                        };
                        diag.warn(
                            WarningKind::CannotShrink,
                            Some(pass.relname),
                            format!(
                                "relation \"{}\" TID {tid}: {what} in progress --- can't shrink relation",
                                pass.relname
                            ),
                        );
                    }
                    scan.shrinkable = false;
                }
            }
            if gone {
                let scratch = temp.get_or_insert_with(|| page.clone());
                scratch.unuse(slot);
                vacpage.offsets.push(slot);
                scan.tups_vacuumed += 1;
            } else {
                scan.num_tuples += 1;
                notup = false;
                scan.min_tlen = scan.min_tlen.min(verdict.len);
                scan.max_tlen = scan.max_tlen.max(verdict.len);
            }
        }

        let do_reap = match temp.as_mut() {
            Some(scratch) => {
                scratch.repair_fragmentation();
                vacpage.free = scratch.raw_free_space();
                true
            }
            None => {
                vacpage.free = page.raw_free_space();
                !vacpage.offsets.is_empty()
            }
        };
        scan.free_size += vacpage.free;
        let do_frag = vacpage.free >= scan.min_tlen || vacpage.free >= page_size / 10;
        scan.pages.insert(vacpage, do_reap, do_frag);

        if notup {
            scan.empty_pages += 1;
            empty_end_pages += 1;
        } else {
            empty_end_pages = 0;
        }
        if changed {
            log_heap_write(pass.wal(), rel, &frame, &mut page)?;
        }
    }

    scan.pages.empty_end_pages = empty_end_pages;
    if scan.shrinkable {
        let limit = nblocks - empty_end_pages;
        let pages = &scan.pages.pages;
        scan.pages.targets.retain(|idx| pages[*idx].blkno < limit);
        scan.usable_free_size = scan.pages.usable_free_space();
    } else {
        scan.pages.targets.clear();
        scan.usable_free_size = 0;
    }
    if scan.usable_free_size > 0 && !scan.vtlinks.is_empty() {
        scan.vtlinks.sort();
    } else {
        scan.vtlinks.clear();
    }

    if scan.num_tuples == 0 {
        scan.min_tlen = 0;
    }
    diag.detail(
        pass.relname,
        &format!(
            "found {} removable, {} nonremovable row versions in {} pages; \
             {} dead row versions cannot be removed yet; \
             nonremovable row versions range from {} to {} bytes long; \
             there were {} unused item pointers; \
             total free space (including removable row versions) is {} bytes; \
             {} pages are or will become empty, including {} at the end of the table; \
             {} pages containing {} free bytes are potential move destinations",
            scan.tups_vacuumed,
            scan.num_tuples,
            nblocks,
            scan.nkeep,
            scan.min_tlen,
            scan.max_tlen,
            scan.nunused,
            scan.free_size,
            scan.empty_pages,
            empty_end_pages,
            scan.pages.targets.len(),
            scan.usable_free_size,
        ),
    );
    debug!(
        rel = rel.0,
        pages = nblocks,
        removable = scan.tups_vacuumed,
        kept = scan.num_tuples,
        recently_dead = scan.nkeep,
        chain_links = scan.vtlinks.len(),
        shrinkable = scan.shrinkable,
        "vacuum.rel.scan"
    );
    Ok(scan)
}
