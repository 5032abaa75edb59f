#![forbid(unsafe_code)]

//! Page-level steps shared by full and lazy vacuum: per-slot
//! classification with freezing, in-place reaping, and the log records the
//! engine writes.

use crate::primitives::wal::{Wal, WalRecord};
use crate::storage::heapam::page_image;
use crate::storage::page::HeapPage;
use crate::storage::relation::PageFrame;
use crate::storage::tuple::{InfoMask, TupleHeader};
use crate::storage::xact::TransactionManager;
use crate::types::{ItemPointer, Lsn, RelId, Result, SlotNo, VacError, Xid};
use crate::vacuum::limits::VacuumLimits;
use crate::vacuum::visibility::{satisfies_vacuum, HtsvResult};

/// Classification of one used slot after hints and freezing were applied.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SlotVerdict {
    pub(crate) result: HtsvResult,
    pub(crate) header: TupleHeader,
    pub(crate) len: usize,
    pub(crate) frozen: bool,
    pub(crate) changed: bool,
}

/// Classifies the version in `slot`, freezing it when it is live and older
/// than the freeze cutoff. Header changes are written back to `page`.
pub(crate) fn classify_slot(
    page: &mut HeapPage,
    slot: SlotNo,
    limits: &VacuumLimits,
    xact: &TransactionManager,
) -> Result<SlotVerdict> {
    let len = page
        .item(slot)
        .map(<[u8]>::len)
        .ok_or(VacError::Invalid("slot is not in use"))?;
    let before = page.header(slot)?;
    let mut header = before;
    let result = satisfies_vacuum(&mut header, limits.oldest_xmin, xact).result;
    let mut frozen = false;
    if result == HtsvResult::Live
        && header.xmin.is_normal()
        && header.xmin.precedes(limits.freeze_limit)
    {
        header.xmin = Xid::FROZEN;
        header.infomask.insert(InfoMask::XMIN_COMMITTED);
        frozen = true;
    }
    let changed = header != before;
    if changed {
        page.set_header(slot, &header)?;
    }
    Ok(SlotVerdict {
        result,
        header,
        len,
        frozen,
        changed,
    })
}

/// Logs an in-place clean of `page` and marks its frame dirty.
pub(crate) fn log_clean(
    wal: &Wal,
    rel: RelId,
    frame: &PageFrame,
    page: &mut HeapPage,
    unused: Vec<SlotNo>,
) -> Result<Lsn> {
    let block = frame.block();
    let lsn = wal.append_with(|lsn| {
        page.set_lsn(lsn);
        Ok(WalRecord::Clean {
            rel,
            unused,
            page: page_image(rel, block, page),
        })
    })?;
    frame.mark_dirty();
    Ok(lsn)
}

/// Logs one relocation. `src` is `None` when source and destination share
/// a page. The caller marks both frames dirty.
pub(crate) fn log_move(
    wal: &Wal,
    rel: RelId,
    from: ItemPointer,
    to: ItemPointer,
    dst: &mut HeapPage,
    src: Option<&mut HeapPage>,
) -> Result<Lsn> {
    wal.append_with(|lsn| {
        let mut pages = Vec::with_capacity(2);
        if let Some(src) = src {
            src.set_lsn(lsn);
            pages.push(page_image(rel, from.block, src));
        }
        dst.set_lsn(lsn);
        pages.push(page_image(rel, to.block, dst));
        Ok(WalRecord::Move {
            rel,
            from,
            to,
            pages,
        })
    })
}

/// Unuses `offsets` and compacts the page, logging the result. A page that
/// already looks like the outcome is left alone; returns whether anything
/// changed.
pub(crate) fn vacuum_page(
    wal: &Wal,
    rel: RelId,
    frame: &PageFrame,
    page: &mut HeapPage,
    offsets: &[SlotNo],
) -> Result<bool> {
    let mut changed = false;
    for slot in offsets {
        changed |= page.unuse(*slot);
    }
    if !changed && page.is_compacted() {
        return Ok(false);
    }
    let unused = page.repair_fragmentation();
    log_clean(wal, rel, frame, page, unused)?;
    Ok(true)
}
