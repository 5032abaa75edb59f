#![forbid(unsafe_code)]

//! Full-mode heap rewriting: relocation of versions from the end of the
//! relation into free space near its start, in-place reaping, and file
//! truncation.
//!
//! The compactor walks pages from the highest block down. Each page is first
//! reaped in place, then every remaining version is moved to the lowest
//! target page with room, a whole update chain at a time where needed. The
//! walk ends at the highest page that received a moved version, or at the
//! first page that could not be emptied. Moves are made durable by recording
//! the vacuum transaction's commit before any moved-in version is marked
//! committed and before the file shrinks.

use std::collections::BTreeSet;

use tracing::info;

use crate::primitives::wal::WalRecord;
use crate::storage::heapam::log_heap_write;
use crate::storage::tuple::{tuple_payload, InfoMask, TupleHeader};
use crate::types::{BlockNumber, ItemPointer, Result, SlotNo, VacError, Xid, FIRST_SLOT};
use crate::vacuum::chain::{needs_chain_move, plan_chain, ChainPlan};
use crate::vacuum::index::vacuum_index;
use crate::vacuum::page_ops::{log_clean, log_move, vacuum_page};
use crate::vacuum::pagelist::{ReapedSet, VacPage, VacPageList, VtLinks};
use crate::vacuum::report::{Diagnostics, RelationReport, WarningKind};
use crate::vacuum::scan::HeapScan;
use crate::vacuum::RelationPass;

/// What the compactor achieved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Compaction {
    pub(crate) moved: u64,
    pub(crate) new_nblocks: BlockNumber,
}

struct Compactor<'s, 'p, 'a> {
    pass: &'p RelationPass<'a>,
    pages: &'s mut VacPageList,
    vtlinks: &'s VtLinks,
    /// Targets still below the page being emptied, in block order.
    active: Vec<usize>,
    cur: Option<usize>,
    moved: u64,
    last_move_dest: i64,
    /// Moved-off versions on pages other than the one being emptied.
    keep_tids: BTreeSet<ItemPointer>,
}

fn moved_off_flags(header: &mut TupleHeader, mover: Xid) {
    header
        .infomask
        .remove(InfoMask::XMIN_COMMITTED | InfoMask::XMIN_INVALID | InfoMask::MOVED_IN);
    header.infomask.insert(InfoMask::MOVED_OFF);
    header.xvac = mover;
}

fn moved_in_flags(header: &mut TupleHeader, mover: Xid) {
    header
        .infomask
        .remove(InfoMask::XMIN_COMMITTED | InfoMask::XMIN_INVALID | InfoMask::MOVED_OFF);
    header.infomask.insert(InfoMask::MOVED_IN);
    header.xvac = mover;
}

impl Compactor<'_, '_, '_> {
    fn note_destination(&mut self, block: BlockNumber) {
        self.last_move_dest = self.last_move_dest.max(i64::from(block));
        self.moved += 1;
    }

    fn index_new_version(&self, tid: ItemPointer, image: &[u8]) -> Result<()> {
        let payload = tuple_payload(image);
        for index in self.pass.heap.indexes() {
            index.insert(tid, payload)?;
        }
        Ok(())
    }

    /// Reaps a destination before its first use.
    fn clean_destination(&self, idx: usize) -> Result<()> {
        let desc = &self.pages.pages[idx];
        let frame = self.pass.file().buffer(desc.blkno)?;
        let mut page = frame.write();
        if !page.is_empty() {
            vacuum_page(self.pass.wal(), self.pass.rel(), &frame, &mut page, &desc.offsets)?;
        }
        Ok(())
    }

    /// Moves one version that is not part of a chain. Returns false when no
    /// target page has room.
    fn move_single(&mut self, tid: ItemPointer, len: usize, vacpage: &mut VacPage) -> Result<bool> {
        let need_new = match self.cur {
            Some(idx) => !self.pages.pages[idx].enough_space(len),
            None => true,
        };
        if need_new {
            let found = self
                .active
                .iter()
                .copied()
                .find(|idx| self.pages.pages[*idx].enough_space(len));
            let Some(idx) = found else {
                return Ok(false);
            };
            self.cur = Some(idx);
            if self.pages.pages[idx].offsets_used == 0 {
                self.clean_destination(idx)?;
            }
        }
        let Some(idx) = self.cur else {
            return Ok(false);
        };

        let pass = self.pass;
        let me = pass.xid();
        let file = pass.file();
        let dst_block = self.pages.pages[idx].blkno;
        let dst_frame = file.buffer(dst_block)?;
        let src_frame = file.buffer(tid.block)?;
        let mut dst = dst_frame.write();
        let mut src = src_frame.write();

        let image = src
            .item(tid.slot)
            .ok_or_else(|| VacError::Integrity(format!("version {tid} vanished while moving")))?
            .to_vec();
        let mut new_header = TupleHeader::decode(&image)?;
        moved_in_flags(&mut new_header, me);
        let new_slot = dst.add_item(&image).ok_or_else(|| {
            VacError::Integrity(format!(
                "failed to add item with len = {len} to page {dst_block} (free space {})",
                dst.raw_free_space()
            ))
        })?;
        let new_tid = ItemPointer::new(dst_block, new_slot);
        new_header.ctid = new_tid;
        dst.set_header(new_slot, &new_header)?;

        let mut old_header = src.header(tid.slot)?;
        moved_off_flags(&mut old_header, me);
        src.set_header(tid.slot, &old_header)?;

        log_move(pass.wal(), pass.rel(), tid, new_tid, &mut dst, Some(&mut *src))?;
        dst_frame.mark_dirty();
        src_frame.mark_dirty();

        let desc = &mut self.pages.pages[idx];
        desc.offsets_used += 1;
        desc.free = dst.raw_free_space();
        drop(src);
        drop(dst);
        self.note_destination(dst_block);
        vacpage.offsets.push(tid.slot);
        self.index_new_version(new_tid, &image)?;
        Ok(true)
    }

    /// Moves the whole chain containing `tid`. Returns false when the chain
    /// was abandoned.
    fn move_chain(
        &mut self,
        tid: ItemPointer,
        header: TupleHeader,
        len: usize,
        vacpage: &mut VacPage,
        diag: &mut Diagnostics,
    ) -> Result<bool> {
        let pass = self.pass;
        let plan = plan_chain(
            pass.file(),
            tid,
            header,
            len,
            pass.limits.oldest_xmin,
            pass.xid(),
            self.vtlinks,
            self.pages,
            &self.active,
        )?;
        let members = match plan {
            ChainPlan::Move(members) => members,
            ChainPlan::Abandoned(reason) => {
                diag.warn(
                    WarningKind::ChainAbandoned,
                    Some(pass.relname),
                    format!("{reason} at {tid} --- stopping relocation"),
                );
                return Ok(false);
            }
        };

        let me = pass.xid();
        let file = pass.file();
        let mut next_ctid: Option<ItemPointer> = None;
        for member in &members {
            let dst_block = self.pages.pages[member.dest].blkno;
            let dst_frame = file.buffer(dst_block)?;
            let src_frame = if member.tid.block == dst_block {
                None
            } else {
                Some(file.buffer(member.tid.block)?)
            };
            let mut dst = dst_frame.write();
            let mut src = src_frame.as_ref().map(|frame| frame.write());

            let image = {
                let holder = match &src {
                    Some(guard) => guard,
                    None => &dst,
                };
                holder
                    .item(member.tid.slot)
                    .ok_or_else(|| {
                        VacError::Integrity(format!("chain member {} vanished", member.tid))
                    })?
                    .to_vec()
            };

            // Slot numbers are stable across compaction, so the source can
            // be marked after its own page was reaped.
            if member.clean_dest && !dst.is_empty() {
                let offsets = self.pages.pages[member.dest].offsets.clone();
                vacuum_page(pass.wal(), pass.rel(), &dst_frame, &mut dst, &offsets)?;
            }

            let mut new_header = TupleHeader::decode(&image)?;
            moved_in_flags(&mut new_header, me);
            let new_slot = dst.add_item(&image).ok_or_else(|| {
                VacError::Integrity(format!(
                    "failed to add item with len = {} to page {dst_block} while moving tuple chain",
                    image.len()
                ))
            })?;
            let new_tid = ItemPointer::new(dst_block, new_slot);
            new_header.ctid = next_ctid.unwrap_or(new_tid);
            dst.set_header(new_slot, &new_header)?;

            {
                let holder = match src.as_mut() {
                    Some(guard) => guard,
                    None => &mut dst,
                };
                let mut old_header = holder.header(member.tid.slot)?;
                moved_off_flags(&mut old_header, me);
                holder.set_header(member.tid.slot, &old_header)?;
            }

            log_move(
                pass.wal(),
                pass.rel(),
                member.tid,
                new_tid,
                &mut dst,
                src.as_deref_mut(),
            )?;
            dst_frame.mark_dirty();
            if let Some(frame) = &src_frame {
                frame.mark_dirty();
            }
            drop(src);
            drop(dst);

            next_ctid = Some(new_tid);
            self.note_destination(dst_block);
            if member.tid.block == vacpage.blkno {
                vacpage.offsets.push(member.tid.slot);
            } else {
                self.keep_tids.insert(member.tid);
            }
            self.index_new_version(new_tid, &image)?;
        }
        Ok(true)
    }
}

/// Reads the header and length of a used slot under a short shared hold.
fn read_slot(
    pass: &RelationPass<'_>,
    block: BlockNumber,
    slot: SlotNo,
) -> Result<Option<(TupleHeader, usize)>> {
    let frame = pass.file().buffer(block)?;
    let page = frame.read();
    match page.item(slot) {
        Some(bytes) => Ok(Some((TupleHeader::decode(bytes)?, bytes.len()))),
        None => Ok(None),
    }
}

fn unexpected_state(relname: &str, tid: ItemPointer, what: &str) -> VacError {
    VacError::Integrity(format!("relation \"{relname}\" TID {tid}: {what}"))
}

/// Relocates versions and truncates the relation. Runs only when the scan
/// found target pages, which implies no version was in progress.
pub(crate) fn repair_frag(
    pass: &RelationPass<'_>,
    scan: &mut HeapScan,
    diag: &mut Diagnostics,
    report: &mut RelationReport,
) -> Result<Compaction> {
    let file = pass.file();
    let rel = pass.rel();
    let me = pass.xid();
    let nblocks = scan.nblocks;
    let num_tuples = scan.num_tuples;
    let mut reap_cursor = scan.pages.reapable.clone();
    let mut nvac: Vec<VacPage> = Vec::new();
    let mut compactor = Compactor {
        pass,
        active: scan.pages.targets.clone(),
        pages: &mut scan.pages,
        vtlinks: &scan.vtlinks,
        cur: None,
        moved: 0,
        last_move_dest: -1,
        keep_tids: BTreeSet::new(),
    };

    let mut blkno = i64::from(nblocks) - i64::from(compactor.pages.empty_end_pages) - 1;
    let mut stopped = false;
    while blkno > compactor.last_move_dest {
        pass.delay_point()?;
        let block = blkno as BlockNumber;
        {
            let pages = &compactor.pages.pages;
            compactor.active.retain(|idx| pages[*idx].blkno < block);
            if compactor.cur.is_some_and(|idx| pages[idx].blkno >= block) {
                compactor.cur = None;
            }
            while reap_cursor
                .last()
                .is_some_and(|idx| pages[*idx].blkno > block)
            {
                reap_cursor.pop();
            }
        }

        let frame = file.buffer(block)?;
        if let Some(&ridx) = reap_cursor.last() {
            if compactor.pages.pages[ridx].blkno == block {
                reap_cursor.pop();
                let offsets = compactor.pages.pages[ridx].offsets.clone();
                let mut page = frame.write();
                if !offsets.is_empty() {
                    vacuum_page(pass.wal(), rel, &frame, &mut page, &offsets)?;
                } else if !page.is_empty() {
                    return Err(VacError::Integrity(format!(
                        "page {block} of relation \"{}\" was expected to be empty",
                        pass.relname
                    )));
                }
                if page.is_empty() {
                    blkno -= 1;
                    continue;
                }
            }
        }

        let mut vacpage = VacPage::new(block);
        let mut left_behind = false;
        let max_slot = frame.read().max_slot();
        for slot in FIRST_SLOT..=max_slot {
            let tid = ItemPointer::new(block, slot);
            let Some((header, len)) = read_slot(pass, block, slot)? else {
                continue;
            };
            if !header.infomask.contains(InfoMask::XMIN_COMMITTED) {
                if header.infomask.contains(InfoMask::MOVED_IN) {
                    return Err(unexpected_state(pass.relname, tid, "HEAP_MOVED_IN was not expected"));
                }
                if !header.infomask.contains(InfoMask::MOVED_OFF) {
                    return Err(unexpected_state(pass.relname, tid, "HEAP_MOVED_OFF was expected"));
                }
                if header.xvac != me {
                    return Err(unexpected_state(pass.relname, tid, "invalid XVAC in tuple header"));
                }
                vacpage.offsets.push(slot);
                continue;
            }
            if stopped {
                left_behind = true;
                continue;
            }
            let moved = if needs_chain_move(&header, tid, pass.limits.oldest_xmin) {
                compactor.move_chain(tid, header, len, &mut vacpage, diag)?
            } else {
                compactor.move_single(tid, len, &mut vacpage)?
            };
            if !moved {
                stopped = true;
                left_behind = true;
            }
        }

        let lo = ItemPointer::new(block, 0);
        let hi = ItemPointer::new(block, SlotNo::MAX);
        let on_page: Vec<ItemPointer> = compactor.keep_tids.range(lo..=hi).copied().collect();
        for tid in on_page {
            compactor.keep_tids.remove(&tid);
            vacpage.offsets.push(tid.slot);
        }
        vacpage.offsets.sort_unstable();
        vacpage.offsets.dedup();
        if !vacpage.offsets.is_empty() {
            nvac.push(vacpage);
        }
        if left_behind {
            break;
        }
        blkno -= 1;
    }
    let new_nblocks = BlockNumber::try_from(blkno + 1).unwrap_or(0);

    if compactor.moved > 0 {
        pass.tx.record_commit()?;
    }

    for idx in &reap_cursor {
        let desc = &compactor.pages.pages[*idx];
        if desc.offsets_used > 0 {
            continue;
        }
        let frame = file.buffer(desc.blkno)?;
        let mut page = frame.write();
        if !page.is_empty() {
            vacuum_page(pass.wal(), rel, &frame, &mut page, &desc.offsets)?;
        }
    }

    let mut checked_moved = 0u64;
    for idx in &compactor.active {
        let desc = &compactor.pages.pages[*idx];
        if desc.offsets_used == 0 {
            continue;
        }
        let frame = file.buffer(desc.blkno)?;
        let mut page = frame.write();
        let mut moved_in = 0usize;
        let mut changed = false;
        let slots: Vec<SlotNo> = page.slot_numbers().collect();
        for slot in slots {
            if !page.is_used(slot) {
                continue;
            }
            let mut header = page.header(slot)?;
            if header.infomask.contains(InfoMask::XMIN_COMMITTED) {
                continue;
            }
            let tid = ItemPointer::new(desc.blkno, slot);
            if !header.infomask.intersects(InfoMask::MOVED) {
                return Err(unexpected_state(
                    pass.relname,
                    tid,
                    "HEAP_MOVED_OFF/HEAP_MOVED_IN was expected",
                ));
            }
            if header.xvac != me {
                return Err(unexpected_state(pass.relname, tid, "invalid XVAC in tuple header"));
            }
            if header.infomask.contains(InfoMask::MOVED_IN) {
                header.infomask.insert(InfoMask::XMIN_COMMITTED);
                header.infomask.remove(InfoMask::MOVED);
                moved_in += 1;
            } else {
                header.infomask.insert(InfoMask::XMIN_INVALID);
            }
            page.set_header(slot, &header)?;
            changed = true;
        }
        if moved_in != desc.offsets_used {
            return Err(VacError::Integrity(format!(
                "page {} of relation \"{}\": {moved_in} moved-in versions, {} expected",
                desc.blkno, pass.relname, desc.offsets_used
            )));
        }
        if changed {
            log_heap_write(pass.wal(), rel, &frame, &mut page)?;
        }
        checked_moved += moved_in as u64;
    }
    if checked_moved != compactor.moved {
        return Err(VacError::Integrity(format!(
            "relation \"{}\": moved {} versions but found {checked_moved} moved in",
            pass.relname, compactor.moved
        )));
    }

    let moved = compactor.moved;
    let keep_tids = std::mem::take(&mut compactor.keep_tids);
    diag.detail(
        pass.relname,
        &format!("moved {moved} row versions, truncated {nblocks} to {new_nblocks} pages"),
    );

    if !nvac.is_empty() || !keep_tids.is_empty() {
        let indexes = pass.heap.indexes();
        if !indexes.is_empty() {
            let reaped = ReapedSet::from_pages_and_tids(&nvac, keep_tids.iter().copied());
            for index in &indexes {
                vacuum_index(
                    pass,
                    index.as_ref(),
                    &|tid| reaped.contains(tid),
                    num_tuples,
                    diag,
                    report,
                )?;
            }
        }
    }

    if let Some(last) = nvac.last() {
        if last.blkno + 1 == new_nblocks {
            clean_moved_off(pass, last.blkno, Some(last.offsets.len()))?;
        }
    }
    let mut leftover_blocks: Vec<BlockNumber> = keep_tids
        .iter()
        .map(|tid| tid.block)
        .filter(|block| *block < new_nblocks)
        .collect();
    leftover_blocks.dedup();
    for block in leftover_blocks {
        clean_moved_off(pass, block, None)?;
    }

    pass.wal().flush()?;
    file.flush()?;
    if new_nblocks < nblocks {
        truncate_heap(pass, new_nblocks)?;
    }
    Ok(Compaction { moved, new_nblocks })
}

/// Unuses the versions this vacuum moved off `block` and compacts the page.
/// With `expected`, the number found must match.
fn clean_moved_off(pass: &RelationPass<'_>, block: BlockNumber, expected: Option<usize>) -> Result<()> {
    let me = pass.xid();
    let frame = pass.file().buffer(block)?;
    let mut page = frame.write();
    let mut removed = 0usize;
    let slots: Vec<SlotNo> = page.slot_numbers().collect();
    for slot in slots {
        if !page.is_used(slot) {
            continue;
        }
        let header = page.header(slot)?;
        if header.infomask.contains(InfoMask::XMIN_COMMITTED) {
            continue;
        }
        let tid = ItemPointer::new(block, slot);
        if header.infomask.contains(InfoMask::MOVED_IN) {
            return Err(unexpected_state(pass.relname, tid, "HEAP_MOVED_IN was not expected"));
        }
        if !header.infomask.contains(InfoMask::MOVED_OFF) {
            if expected.is_none() {
                continue;
            }
            return Err(unexpected_state(pass.relname, tid, "HEAP_MOVED_OFF was expected"));
        }
        if header.xvac != me {
            return Err(unexpected_state(pass.relname, tid, "invalid XVAC in tuple header"));
        }
        page.unuse(slot);
        removed += 1;
    }
    if let Some(expected) = expected {
        if removed != expected {
            return Err(VacError::Integrity(format!(
                "page {block} of relation \"{}\": removed {removed} moved-off versions, {expected} expected",
                pass.relname
            )));
        }
    }
    if removed > 0 {
        let unused = page.repair_fragmentation();
        log_clean(pass.wal(), pass.rel(), &frame, &mut page, unused)?;
    }
    Ok(())
}

/// Reaps every reapable page in place and truncates the empty tail. Used
/// when nothing can be relocated. Returns the new page count.
pub(crate) fn vacuum_heap(pass: &RelationPass<'_>, scan: &HeapScan, diag: &mut Diagnostics) -> Result<BlockNumber> {
    let file = pass.file();
    let keep = scan.nblocks - scan.pages.empty_end_pages;
    for desc in scan.pages.reapable_pages() {
        if desc.blkno >= keep || desc.offsets.is_empty() {
            continue;
        }
        pass.delay_point()?;
        let frame = file.buffer(desc.blkno)?;
        let mut page = frame.write();
        vacuum_page(pass.wal(), pass.rel(), &frame, &mut page, &desc.offsets)?;
    }
    pass.wal().flush()?;
    file.flush()?;
    if scan.pages.empty_end_pages > 0 {
        diag.detail(
            pass.relname,
            &format!("truncated {} to {keep} pages", scan.nblocks),
        );
        truncate_heap(pass, keep)?;
        return Ok(keep);
    }
    Ok(scan.nblocks)
}

/// Logs and performs a truncation to `nblocks`, then drops free-space
/// entries past the new end.
pub(crate) fn truncate_heap(pass: &RelationPass<'_>, nblocks: BlockNumber) -> Result<BlockNumber> {
    let rel = pass.rel();
    let wal = pass.wal();
    wal.append(WalRecord::Truncate { rel, nblocks })?;
    wal.flush()?;
    let before = pass.file().nblocks();
    let after = pass.file().truncate(nblocks)?;
    pass.fsm().truncate_relation(rel, after);
    info!(rel = rel.0, before, after, "vacuum.rel.truncated");
    Ok(after)
}
