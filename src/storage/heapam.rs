#![forbid(unsafe_code)]

//! Regular versioned writes against a heap relation.
//!
//! Every change takes the page's exclusive hold, logs the post-change page
//! image and marks the frame dirty before the hold is released.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::primitives::wal::{PageImage, Wal, WalRecord};
use crate::storage::catalog::RelationDef;
use crate::storage::fsm::FreeSpaceMap;
use crate::storage::index::IndexAccessMethod;
use crate::storage::page::{HeapPage, ITEM_ID_LEN, PAGE_HEADER_LEN};
use crate::storage::relation::{PageFrame, RelationFile};
use crate::storage::tuple::{encode_tuple, tuple_payload, InfoMask, TupleHeader};
use crate::storage::xact::{TransactionManager, XactStatus};
use crate::types::{max_align, BlockNumber, ItemPointer, Lsn, RelId, Result, VacError, Xid};

/// Shared services a heap write needs.
#[derive(Clone, Copy)]
pub struct HeapContext<'a> {
    /// Write-ahead log.
    pub wal: &'a Wal,
    /// Free-space directory.
    pub fsm: &'a FreeSpaceMap,
    /// Transaction status.
    pub xact: &'a TransactionManager,
}

/// Encoded image of `page` as block `block` of `rel`.
pub fn page_image(rel: RelId, block: BlockNumber, page: &HeapPage) -> PageImage {
    PageImage {
        block,
        bytes: page.encode(rel.0, block),
    }
}

/// Logs a regular write of `page` and marks its frame dirty.
pub fn log_heap_write(
    wal: &Wal,
    rel: RelId,
    frame: &PageFrame,
    page: &mut HeapPage,
) -> Result<Lsn> {
    let block = frame.block();
    let lsn = wal.append_with(|lsn| {
        page.set_lsn(lsn);
        Ok(WalRecord::HeapWrite {
            rel,
            page: page_image(rel, block, page),
        })
    })?;
    frame.mark_dirty();
    Ok(lsn)
}

/// Heap relation: its definition, page file and indexes.
pub struct HeapRelation {
    def: RwLock<RelationDef>,
    file: Arc<RelationFile>,
    indexes: RwLock<Vec<Arc<dyn IndexAccessMethod>>>,
}

impl HeapRelation {
    /// Wraps an opened page file.
    pub fn new(def: RelationDef, file: Arc<RelationFile>) -> Self {
        Self {
            def: RwLock::new(def),
            file,
            indexes: RwLock::new(Vec::new()),
        }
    }

    /// Relation id.
    pub fn id(&self) -> RelId {
        self.file.rel()
    }

    /// Copy of the catalog definition.
    pub fn def(&self) -> RelationDef {
        self.def.read().clone()
    }

    pub(crate) fn set_def(&self, def: RelationDef) {
        *self.def.write() = def;
    }

    /// Page file.
    pub fn file(&self) -> &Arc<RelationFile> {
        &self.file
    }

    /// Attached indexes.
    pub fn indexes(&self) -> Vec<Arc<dyn IndexAccessMethod>> {
        self.indexes.read().clone()
    }

    /// Attaches an index; the caller fills it.
    pub fn attach_index(&self, index: Arc<dyn IndexAccessMethod>) {
        self.indexes.write().push(index);
    }

    fn max_tuple_len(&self) -> usize {
        self.file.page_size() - PAGE_HEADER_LEN - ITEM_ID_LEN
    }

    fn insert_version(&self, cx: HeapContext<'_>, header: TupleHeader, payload: &[u8]) -> Result<ItemPointer> {
        let image = encode_tuple(&header, payload)?;
        if max_align(image.len()) > self.max_tuple_len() {
            return Err(VacError::InvalidOwned(format!(
                "row of {} bytes does not fit on a page",
                image.len()
            )));
        }
        let rel = self.id();
        let needed = max_align(image.len());
        let mut candidates = Vec::with_capacity(2);
        if let Some(block) = cx.fsm.page_with_free_space(rel, needed) {
            candidates.push(block);
        }
        let nblocks = self.file.nblocks();
        if nblocks > 0 && !candidates.contains(&(nblocks - 1)) {
            candidates.push(nblocks - 1);
        }
        for block in candidates {
            if block >= self.file.nblocks() {
                continue;
            }
            let frame = self.file.buffer(block)?;
            if let Some(tid) = self.try_place(cx, &frame, header, &image)? {
                return Ok(tid);
            }
        }
        let frame = self.file.extend()?;
        self.try_place(cx, &frame, header, &image)?
            .ok_or(VacError::Invalid("row does not fit on an empty page"))
    }

    fn try_place(
        &self,
        cx: HeapContext<'_>,
        frame: &PageFrame,
        mut header: TupleHeader,
        image: &[u8],
    ) -> Result<Option<ItemPointer>> {
        let rel = self.id();
        let mut page = frame.write();
        if page.is_new() {
            page.init();
        }
        let Some(slot) = page.add_item(image) else {
            cx.fsm.record_page_free_space(rel, frame.block(), page.free_space());
            return Ok(None);
        };
        let tid = ItemPointer::new(frame.block(), slot);
        header.ctid = tid;
        page.set_header(slot, &header)?;
        log_heap_write(cx.wal, rel, frame, &mut page)?;
        cx.fsm.record_page_free_space(rel, frame.block(), page.free_space());
        Ok(Some(tid))
    }

    fn index_version(&self, tid: ItemPointer, payload: &[u8]) -> Result<()> {
        for index in self.indexes.read().iter() {
            index.insert(tid, payload)?;
        }
        Ok(())
    }

    /// Inserts a new row created by `xid`.
    pub fn insert(&self, cx: HeapContext<'_>, xid: Xid, payload: &[u8]) -> Result<ItemPointer> {
        let tid = self.insert_version(cx, TupleHeader::for_insert(xid, ItemPointer::INVALID), payload)?;
        self.index_version(tid, payload)?;
        trace!(rel = self.id().0, %tid, xid = xid.0, "heap.insert");
        Ok(tid)
    }

    fn check_writable(cx: HeapContext<'_>, xid: Xid, tid: ItemPointer, header: &TupleHeader) -> Result<()> {
        if header.infomask.contains(InfoMask::XMIN_INVALID) {
            return Err(VacError::ConcurrentUpdate(tid));
        }
        if header.infomask.contains(InfoMask::XMAX_INVALID) || header.xmax == xid {
            return Ok(());
        }
        match cx.xact.status(header.xmax) {
            XactStatus::Aborted => Ok(()),
            XactStatus::Committed if header.infomask.contains(InfoMask::MARKED_FOR_UPDATE) => Ok(()),
            _ => Err(VacError::ConcurrentUpdate(tid)),
        }
    }

    fn modify_header(
        &self,
        cx: HeapContext<'_>,
        xid: Xid,
        tid: ItemPointer,
        apply: impl FnOnce(&mut TupleHeader),
    ) -> Result<()> {
        let frame = self.file.buffer(tid.block)?;
        let mut page = frame.write();
        let mut header = page
            .header(tid.slot)
            .map_err(|_| VacError::NotFound(format!("row version {tid}")))?;
        Self::check_writable(cx, xid, tid, &header)?;
        apply(&mut header);
        page.set_header(tid.slot, &header)?;
        log_heap_write(cx.wal, self.id(), &frame, &mut page)?;
        Ok(())
    }

    fn stamp_deleter(header: &mut TupleHeader, xid: Xid) {
        header.xmax = xid;
        header.infomask.remove(
            InfoMask::XMAX_INVALID | InfoMask::XMAX_COMMITTED | InfoMask::MARKED_FOR_UPDATE,
        );
    }

    /// Replaces the row at `tid` with a new version. On error the
    /// transaction must be aborted.
    pub fn update(
        &self,
        cx: HeapContext<'_>,
        xid: Xid,
        tid: ItemPointer,
        payload: &[u8],
    ) -> Result<ItemPointer> {
        {
            let frame = self.file.buffer(tid.block)?;
            let page = frame.read();
            let header = page
                .header(tid.slot)
                .map_err(|_| VacError::NotFound(format!("row version {tid}")))?;
            Self::check_writable(cx, xid, tid, &header)?;
        }
        let mut successor = TupleHeader::for_insert(xid, ItemPointer::INVALID);
        successor.infomask.insert(InfoMask::UPDATED);
        let new_tid = self.insert_version(cx, successor, payload)?;
        self.modify_header(cx, xid, tid, |header| {
            Self::stamp_deleter(header, xid);
            header.ctid = new_tid;
        })?;
        self.index_version(new_tid, payload)?;
        trace!(rel = self.id().0, old = %tid, new = %new_tid, "heap.update");
        Ok(new_tid)
    }

    /// Deletes the row at `tid`.
    pub fn delete(&self, cx: HeapContext<'_>, xid: Xid, tid: ItemPointer) -> Result<()> {
        self.modify_header(cx, xid, tid, |header| Self::stamp_deleter(header, xid))
    }

    /// Row-locks the version at `tid` without deleting it.
    pub fn lock_tuple(&self, cx: HeapContext<'_>, xid: Xid, tid: ItemPointer) -> Result<()> {
        self.modify_header(cx, xid, tid, |header| {
            Self::stamp_deleter(header, xid);
            header.infomask.insert(InfoMask::MARKED_FOR_UPDATE);
        })
    }

    /// Header and payload of the version at `tid`, if the slot is in use.
    pub fn fetch(&self, tid: ItemPointer) -> Result<Option<(TupleHeader, Vec<u8>)>> {
        if tid.block >= self.file.nblocks() {
            return Ok(None);
        }
        let frame = self.file.buffer(tid.block)?;
        let page = frame.read();
        match page.item(tid.slot) {
            Some(bytes) => Ok(Some((TupleHeader::decode(bytes)?, tuple_payload(bytes).to_vec()))),
            None => Ok(None),
        }
    }

    /// Rows whose creator committed and whose deleter did not, by location.
    /// Reads only; status bits are not touched.
    pub fn committed_rows(&self, xact: &TransactionManager) -> Result<Vec<(ItemPointer, Vec<u8>)>> {
        let mut rows = Vec::new();
        for block in 0..self.file.nblocks() {
            let frame = self.file.buffer(block)?;
            let page = frame.read();
            for slot in page.slot_numbers() {
                let Some(bytes) = page.item(slot) else {
                    continue;
                };
                let header = TupleHeader::decode(bytes)?;
                if row_is_committed_live(xact, &header) {
                    rows.push((ItemPointer::new(block, slot), tuple_payload(bytes).to_vec()));
                }
            }
        }
        Ok(rows)
    }

    /// Adds an entry to `index` for every used slot of the heap.
    pub fn fill_index(&self, index: &dyn IndexAccessMethod) -> Result<usize> {
        let mut entries = 0;
        for block in 0..self.file.nblocks() {
            let frame = self.file.buffer(block)?;
            let page = frame.read();
            for slot in page.slot_numbers() {
                if let Some(bytes) = page.item(slot) {
                    if index.insert(ItemPointer::new(block, slot), tuple_payload(bytes))? {
                        entries += 1;
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Fills every attached index from the heap's used slots.
    pub fn rebuild_indexes(&self) -> Result<usize> {
        let mut entries = 0;
        for index in self.indexes() {
            entries += self.fill_index(index.as_ref())?;
        }
        Ok(entries)
    }
}

fn row_is_committed_live(xact: &TransactionManager, header: &TupleHeader) -> bool {
    let mask = header.infomask;
    if mask.contains(InfoMask::XMIN_INVALID) {
        return false;
    }
    if mask.contains(InfoMask::MOVED_OFF) && xact.did_commit(header.xvac) {
        return false;
    }
    if mask.contains(InfoMask::MOVED_IN) && !xact.did_commit(header.xvac) {
        return false;
    }
    if !mask.contains(InfoMask::XMIN_COMMITTED) && !xact.did_commit(header.xmin) {
        return false;
    }
    if mask.intersects(InfoMask::XMAX_INVALID | InfoMask::MARKED_FOR_UPDATE) {
        return true;
    }
    !(mask.contains(InfoMask::XMAX_COMMITTED) || xact.did_commit(header.xmax))
}

impl std::fmt::Debug for HeapRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRelation")
            .field("id", &self.id())
            .field("nblocks", &self.file.nblocks())
            .field("indexes", &self.indexes.read().len())
            .finish()
    }
}
