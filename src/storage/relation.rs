#![forbid(unsafe_code)]

//! Page file of one relation with a write-back page cache.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::storage::page::HeapPage;
use crate::types::{BlockNumber, Lsn, RelId, Result, VacError};

/// Running page-access counters of one relation file.
#[derive(Debug, Default)]
struct BufferUsage {
    hits: AtomicU64,
    misses: AtomicU64,
    dirtied: AtomicU64,
}

/// Page accesses counted since the file was opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Lookups served from the page cache.
    pub hits: u64,
    /// Lookups that read the page from the file.
    pub misses: u64,
    /// Clean pages that became dirty, extensions included.
    pub dirtied: u64,
}

/// Cached page plus its dirty flag.
///
/// Readers take the shared hold, anything that changes bytes takes the
/// exclusive hold and calls [`PageFrame::mark_dirty`] before releasing it.
pub struct PageFrame {
    block: BlockNumber,
    page: RwLock<HeapPage>,
    dirty: AtomicBool,
    usage: Arc<BufferUsage>,
}

impl PageFrame {
    fn new(block: BlockNumber, page: HeapPage, dirty: bool, usage: Arc<BufferUsage>) -> Self {
        if dirty {
            usage.dirtied.fetch_add(1, Ordering::Relaxed);
        }
        Self {
            block,
            page: RwLock::new(page),
            dirty: AtomicBool::new(dirty),
            usage,
        }
    }

    /// Block number this frame caches.
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Shared page hold.
    pub fn read(&self) -> RwLockReadGuard<'_, HeapPage> {
        self.page.read()
    }

    /// Exclusive page hold.
    pub fn write(&self) -> RwLockWriteGuard<'_, HeapPage> {
        self.page.write()
    }

    /// Exclusive page hold without waiting; `None` if anyone holds the page.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, HeapPage>> {
        self.page.try_write()
    }

    /// Flags the page for write-back.
    pub fn mark_dirty(&self) {
        if !self.dirty.swap(true, Ordering::AcqRel) {
            self.usage.dirtied.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// True if the cached page differs from disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Shared handle to a cached page.
pub type Buffer = Arc<PageFrame>;

/// One relation's page file.
pub struct RelationFile {
    rel: RelId,
    io: Arc<dyn FileIo>,
    page_size: usize,
    frames: Mutex<FxHashMap<BlockNumber, Buffer>>,
    nblocks: AtomicU32,
    extend_lock: Mutex<()>,
    usage: Arc<BufferUsage>,
}

impl RelationFile {
    /// Opens the relation stored in `io`. A partial trailing page left by an
    /// interrupted extension is cut off.
    pub fn open(rel: RelId, io: Arc<dyn FileIo>, page_size: usize) -> Result<Self> {
        let len = io.len()?;
        let page_len = page_size as u64;
        if len % page_len != 0 {
            warn!(rel = rel.0, len, "relation.partial_page_truncated");
            io.truncate(len - len % page_len)?;
        }
        let nblocks = u32::try_from(len / page_len)
            .map_err(|_| VacError::Corruption("relation has too many blocks"))?;
        Ok(Self {
            rel,
            io,
            page_size,
            frames: Mutex::new(FxHashMap::default()),
            nblocks: AtomicU32::new(nblocks),
            extend_lock: Mutex::new(()),
            usage: Arc::default(),
        })
    }

    /// Relation identifier.
    pub fn rel(&self) -> RelId {
        self.rel
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current number of blocks.
    pub fn nblocks(&self) -> BlockNumber {
        self.nblocks.load(Ordering::Acquire)
    }

    fn offset_of(&self, block: BlockNumber) -> u64 {
        u64::from(block) * self.page_size as u64
    }

    /// Returns the cached page for `block`, reading it on first use.
    pub fn buffer(&self, block: BlockNumber) -> Result<Buffer> {
        if block >= self.nblocks() {
            return Err(VacError::InvalidOwned(format!(
                "block {block} beyond end of relation {}",
                self.rel
            )));
        }
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&block) {
            self.usage.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(frame.clone());
        }
        self.usage.misses.fetch_add(1, Ordering::Relaxed);
        let mut image = vec![0u8; self.page_size];
        self.io.read_at(self.offset_of(block), &mut image)?;
        let page = HeapPage::decode(self.rel.0, block, &image)?;
        let frame = Arc::new(PageFrame::new(block, page, false, self.usage.clone()));
        frames.insert(block, frame.clone());
        Ok(frame)
    }

    /// Appends one initialized page. The file grows by a zeroed page right
    /// away; the initialized image reaches disk at the next flush.
    pub fn extend(&self) -> Result<Buffer> {
        let _guard = self.extend_lock.lock();
        let block = self.nblocks();
        if block == u32::MAX - 1 {
            return Err(VacError::Invalid("relation block limit reached"));
        }
        self.io
            .write_at(self.offset_of(block), &vec![0u8; self.page_size])?;
        let frame = Arc::new(PageFrame::new(
            block,
            HeapPage::new(self.page_size),
            true,
            self.usage.clone(),
        ));
        self.frames.lock().insert(block, frame.clone());
        self.nblocks.store(block + 1, Ordering::Release);
        Ok(frame)
    }

    /// Writes every dirty page back. The caller must flush the log first.
    pub fn flush(&self) -> Result<usize> {
        let mut dirty: Vec<Buffer> = self
            .frames
            .lock()
            .values()
            .filter(|frame| frame.is_dirty())
            .cloned()
            .collect();
        dirty.sort_by_key(|frame| frame.block);
        for frame in &dirty {
            let image = {
                let page = frame.read();
                frame.dirty.store(false, Ordering::Release);
                page.encode(self.rel.0, frame.block)
            };
            self.io.write_at(self.offset_of(frame.block), &image)?;
        }
        if !dirty.is_empty() {
            self.io.sync_all()?;
        }
        debug!(rel = self.rel.0, pages = dirty.len(), "relation.flush");
        Ok(dirty.len())
    }

    /// Cuts the relation down to `nblocks` pages, discarding cached pages
    /// past the new end.
    pub fn truncate(&self, nblocks: BlockNumber) -> Result<BlockNumber> {
        let _guard = self.extend_lock.lock();
        let current = self.nblocks();
        if nblocks >= current {
            return Ok(current);
        }
        self.frames.lock().retain(|block, _| *block < nblocks);
        self.io.truncate(self.offset_of(nblocks))?;
        self.io.sync_all()?;
        self.nblocks.store(nblocks, Ordering::Release);
        Ok(nblocks)
    }

    /// Installs a logged page image during recovery unless the stored page
    /// already carries this change.
    pub(crate) fn redo_page_image(
        &self,
        block: BlockNumber,
        record_lsn: Lsn,
        image: &[u8],
    ) -> Result<bool> {
        if image.len() != self.page_size {
            return Err(VacError::Corruption("logged page image has wrong size"));
        }
        let _guard = self.extend_lock.lock();
        let nblocks = self.nblocks();
        if block < nblocks {
            let mut current = vec![0u8; self.page_size];
            self.io.read_at(self.offset_of(block), &mut current)?;
            if let Ok(page) = HeapPage::decode(self.rel.0, block, &current) {
                if !page.is_new() && page.lsn() >= record_lsn {
                    return Ok(false);
                }
            }
        } else {
            let zero = vec![0u8; self.page_size];
            for missing in nblocks..block {
                self.io.write_at(self.offset_of(missing), &zero)?;
            }
            self.nblocks.store(block + 1, Ordering::Release);
        }
        self.io.write_at(self.offset_of(block), image)?;
        self.frames.lock().remove(&block);
        Ok(true)
    }

    /// Page-access counters so far.
    pub fn usage(&self) -> UsageSnapshot {
        UsageSnapshot {
            hits: self.usage.hits.load(Ordering::Relaxed),
            misses: self.usage.misses.load(Ordering::Relaxed),
            dirtied: self.usage.dirtied.load(Ordering::Relaxed),
        }
    }

    /// Number of cached pages.
    pub fn cached_pages(&self) -> usize {
        self.frames.lock().len()
    }
}

impl std::fmt::Debug for RelationFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationFile")
            .field("rel", &self.rel)
            .field("page_size", &self.page_size)
            .field("nblocks", &self.nblocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use crate::storage::tuple::{encode_tuple, TupleHeader};
    use crate::types::{ItemPointer, Xid};

    fn relation() -> (Arc<MemFileIo>, RelationFile) {
        let io = Arc::new(MemFileIo::new());
        let rel = RelationFile::open(RelId(10), io.clone(), 1024).unwrap();
        (io, rel)
    }

    #[test]
    fn extend_flush_reopen() {
        let (io, rel) = relation();
        let buf = rel.extend().unwrap();
        {
            let mut page = buf.write();
            let header = TupleHeader::for_insert(Xid(3), ItemPointer::new(0, 1));
            page.add_item(&encode_tuple(&header, b"row").unwrap()).unwrap();
            buf.mark_dirty();
        }
        assert_eq!(rel.flush().unwrap(), 1);
        assert_eq!(rel.flush().unwrap(), 0);
        let reopened = RelationFile::open(RelId(10), io, 1024).unwrap();
        assert_eq!(reopened.nblocks(), 1);
        let page = reopened.buffer(0).unwrap();
        assert!(page.read().is_used(1));
    }

    #[test]
    fn usage_counts_hits_misses_and_first_dirtying() {
        let (io, rel) = relation();
        rel.extend().unwrap();
        rel.flush().unwrap();
        assert_eq!(rel.usage().dirtied, 1);

        let reopened = RelationFile::open(RelId(10), io, 1024).unwrap();
        let frame = reopened.buffer(0).unwrap();
        reopened.buffer(0).unwrap();
        frame.mark_dirty();
        frame.mark_dirty();
        assert_eq!(
            reopened.usage(),
            UsageSnapshot {
                hits: 1,
                misses: 1,
                dirtied: 1,
            }
        );
    }

    #[test]
    fn truncate_drops_tail() {
        let (io, rel) = relation();
        for _ in 0..4 {
            rel.extend().unwrap();
        }
        rel.flush().unwrap();
        assert_eq!(rel.truncate(2).unwrap(), 2);
        assert_eq!(rel.nblocks(), 2);
        assert_eq!(io.len().unwrap(), 2048);
        assert!(rel.buffer(2).is_err());
        assert_eq!(rel.truncate(5).unwrap(), 2);
    }

    #[test]
    fn unflushed_extension_reads_back_as_new_page() {
        let (io, rel) = relation();
        rel.extend().unwrap();
        drop(rel);
        let reopened = RelationFile::open(RelId(10), io, 1024).unwrap();
        assert!(reopened.buffer(0).unwrap().read().is_new());
    }

    #[test]
    fn redo_skips_pages_that_already_have_the_change() {
        let (_io, rel) = relation();
        let buf = rel.extend().unwrap();
        buf.write().set_lsn(Lsn(10));
        rel.flush().unwrap();
        let mut newer = HeapPage::new(1024);
        newer.set_lsn(Lsn(5));
        assert!(!rel
            .redo_page_image(0, Lsn(5), &newer.encode(10, 0))
            .unwrap());
        newer.set_lsn(Lsn(20));
        assert!(rel
            .redo_page_image(3, Lsn(20), &newer.encode(10, 3))
            .unwrap());
        assert_eq!(rel.nblocks(), 4);
        assert!(rel.buffer(1).unwrap().read().is_new());
        assert_eq!(rel.buffer(3).unwrap().read().lsn(), Lsn(20));
    }
}
