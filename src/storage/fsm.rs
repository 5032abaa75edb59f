#![forbid(unsafe_code)]

//! Shared free-space directory consulted by inserts and refreshed by vacuum.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::types::{BlockNumber, RelId};

/// Known free bytes on one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FreeSpaceEntry {
    /// Page number.
    pub block: BlockNumber,
    /// Free bytes usable by a new tuple.
    pub avail: usize,
}

/// Directory usage summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FsmStatistics {
    /// Relations with an entry set.
    pub relations: usize,
    /// Page entries currently stored.
    pub pages_stored: usize,
    /// Page entries that were offered by the last reports.
    pub pages_requested: usize,
    /// Configured capacity.
    pub max_pages: usize,
}

#[derive(Debug)]
struct FsmRel {
    pages: Vec<FreeSpaceEntry>,
    avg_request: usize,
    requested: usize,
}

/// Relation-scoped map of pages with free space.
pub struct FreeSpaceMap {
    rels: Mutex<FxHashMap<RelId, FsmRel>>,
    max_pages: usize,
    initial_avg_request: usize,
}

impl FreeSpaceMap {
    /// Directory holding at most `max_pages` entries over all relations.
    pub fn new(max_pages: usize, page_size: usize) -> Self {
        Self {
            rels: Mutex::new(FxHashMap::default()),
            max_pages,
            initial_avg_request: page_size / 32,
        }
    }

    fn fresh(&self) -> FsmRel {
        FsmRel {
            pages: Vec::new(),
            avg_request: self.initial_avg_request,
            requested: 0,
        }
    }

    /// Moving average of space requests made against `rel`.
    pub fn avg_request_size(&self, rel: RelId) -> usize {
        self.rels
            .lock()
            .get(&rel)
            .map(|r| r.avg_request)
            .unwrap_or(self.initial_avg_request)
    }

    /// Replaces everything known about `rel` with `entries`. When the
    /// directory is short on room the pages with the most space win.
    pub fn record_relation_free_space(&self, rel: RelId, mut entries: Vec<FreeSpaceEntry>) {
        let mut rels = self.rels.lock();
        let used_elsewhere: usize = rels
            .iter()
            .filter(|(id, _)| **id != rel)
            .map(|(_, r)| r.pages.len())
            .sum();
        let budget = self.max_pages.saturating_sub(used_elsewhere);
        let requested = entries.len();
        if entries.len() > budget {
            entries.sort_by(|a, b| b.avail.cmp(&a.avail).then(a.block.cmp(&b.block)));
            entries.truncate(budget);
        }
        entries.sort_by_key(|entry| entry.block);
        entries.dedup_by_key(|entry| entry.block);
        let slot = rels.entry(rel).or_insert_with(|| self.fresh());
        slot.pages = entries;
        slot.requested = requested;
    }

    /// Page believed to have at least `needed` free bytes.
    pub fn page_with_free_space(&self, rel: RelId, needed: usize) -> Option<BlockNumber> {
        let mut rels = self.rels.lock();
        let slot = rels.entry(rel).or_insert_with(|| self.fresh());
        let avg = slot.avg_request as isize;
        slot.avg_request = (avg + (needed as isize - avg) / 32).max(1) as usize;
        slot.pages
            .iter()
            .find(|entry| entry.avail >= needed)
            .map(|entry| entry.block)
    }

    /// Updates one page after an insert consumed or freed space.
    pub fn record_page_free_space(&self, rel: RelId, block: BlockNumber, avail: usize) {
        let mut rels = self.rels.lock();
        let Some(slot) = rels.get_mut(&rel) else {
            return;
        };
        match slot.pages.binary_search_by_key(&block, |e| e.block) {
            Ok(idx) => slot.pages[idx].avail = avail,
            Err(idx) => slot.pages.insert(idx, FreeSpaceEntry { block, avail }),
        }
    }

    /// Drops entries at or beyond `nblocks` after a truncation.
    pub fn truncate_relation(&self, rel: RelId, nblocks: BlockNumber) {
        if let Some(slot) = self.rels.lock().get_mut(&rel) {
            slot.pages.retain(|entry| entry.block < nblocks);
        }
    }

    /// Forgets a dropped relation.
    pub fn forget_relation(&self, rel: RelId) {
        self.rels.lock().remove(&rel);
    }

    /// Entries stored for `rel`, by block.
    pub fn entries(&self, rel: RelId) -> Vec<FreeSpaceEntry> {
        self.rels
            .lock()
            .get(&rel)
            .map(|r| r.pages.clone())
            .unwrap_or_default()
    }

    /// Usage summary.
    pub fn statistics(&self) -> FsmStatistics {
        let rels = self.rels.lock();
        FsmStatistics {
            relations: rels.len(),
            pages_stored: rels.values().map(|r| r.pages.len()).sum(),
            pages_requested: rels.values().map(|r| r.requested).sum(),
            max_pages: self.max_pages,
        }
    }
}
