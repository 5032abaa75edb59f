#![forbid(unsafe_code)]

//! Page inventories built by the scanner.
//!
//! Reapable and target lists share page descriptors: a target page's
//! reserved-slot count must be visible through the reapable list too. Both
//! lists therefore hold indices into one arena.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::storage::page::ITEM_ID_LEN;
use crate::types::{max_align, BlockNumber, ItemPointer, SlotNo};

/// Scan result for one page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct VacPage {
    pub(crate) blkno: BlockNumber,
    /// Contiguous free bytes once the page's removable versions are gone.
    pub(crate) free: usize,
    /// Relocated versions placed (or reserved) on this page.
    pub(crate) offsets_used: usize,
    /// Sorted slots that are or will become unused.
    pub(crate) offsets: Vec<SlotNo>,
}

impl VacPage {
    pub(crate) fn new(blkno: BlockNumber) -> Self {
        Self {
            blkno,
            free: 0,
            offsets_used: 0,
            offsets: Vec::new(),
        }
    }

    /// True if a version of `len` bytes fits, counting reusable slots.
    pub(crate) fn enough_space(&self, len: usize) -> bool {
        let len = max_align(len);
        if len > self.free {
            return false;
        }
        if self.offsets_used < self.offsets.len() {
            return true;
        }
        len + ITEM_ID_LEN <= self.free
    }

    /// Reserves room for a version of `len` bytes; returns the bytes taken.
    pub(crate) fn reserve(&mut self, len: usize) -> usize {
        let mut taken = max_align(len);
        if self.offsets_used >= self.offsets.len() {
            taken += ITEM_ID_LEN;
        }
        self.free = self.free.saturating_sub(taken);
        self.offsets_used += 1;
        taken
    }

    /// Undoes a [`VacPage::reserve`].
    pub(crate) fn release(&mut self, taken: usize) {
        self.free += taken;
        self.offsets_used = self.offsets_used.saturating_sub(1);
    }
}

/// Reapable and target lists over one descriptor arena, both in block order.
#[derive(Debug, Default)]
pub(crate) struct VacPageList {
    pub(crate) pages: Vec<VacPage>,
    pub(crate) reapable: Vec<usize>,
    pub(crate) targets: Vec<usize>,
    /// Trailing pages that are or will become empty.
    pub(crate) empty_end_pages: BlockNumber,
}

impl VacPageList {
    pub(crate) fn insert(&mut self, page: VacPage, reap: bool, target: bool) {
        if !reap && !target {
            return;
        }
        let idx = self.pages.len();
        self.pages.push(page);
        if reap {
            self.reapable.push(idx);
        }
        if target {
            self.targets.push(idx);
        }
    }

    pub(crate) fn reapable_pages(&self) -> impl Iterator<Item = &VacPage> {
        self.reapable.iter().map(|idx| &self.pages[*idx])
    }

    pub(crate) fn target_pages(&self) -> impl Iterator<Item = &VacPage> {
        self.targets.iter().map(|idx| &self.pages[*idx])
    }

    /// Free bytes summed over the target list.
    pub(crate) fn usable_free_space(&self) -> usize {
        self.target_pages().map(|page| page.free).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Reaped {
    Whole,
    Slots(Vec<SlotNo>),
}

/// Lookup answering "was the row at this location reaped?" for index
/// bulk delete.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReapedSet {
    blocks: Vec<(BlockNumber, Reaped)>,
}

impl ReapedSet {
    /// Builds the set from descriptors. A descriptor without slots reaps
    /// its whole page.
    pub(crate) fn from_pages<'a>(pages: impl IntoIterator<Item = &'a VacPage>) -> Self {
        let mut merged: BTreeMap<BlockNumber, Reaped> = BTreeMap::new();
        for page in pages {
            let incoming = if page.offsets.is_empty() {
                Reaped::Whole
            } else {
                Reaped::Slots(page.offsets.clone())
            };
            merge(&mut merged, page.blkno, incoming);
        }
        Self::finish(merged)
    }

    /// Same as [`ReapedSet::from_pages`] plus individual locations.
    pub(crate) fn from_pages_and_tids<'a>(
        pages: impl IntoIterator<Item = &'a VacPage>,
        tids: impl IntoIterator<Item = ItemPointer>,
    ) -> Self {
        let mut merged: BTreeMap<BlockNumber, Reaped> = BTreeMap::new();
        for page in pages {
            merge(&mut merged, page.blkno, Reaped::Slots(page.offsets.clone()));
        }
        for tid in tids {
            merge(&mut merged, tid.block, Reaped::Slots(vec![tid.slot]));
        }
        Self::finish(merged)
    }

    fn finish(merged: BTreeMap<BlockNumber, Reaped>) -> Self {
        let blocks = merged
            .into_iter()
            .map(|(block, reaped)| match reaped {
                Reaped::Slots(mut slots) => {
                    slots.sort_unstable();
                    slots.dedup();
                    (block, Reaped::Slots(slots))
                }
                whole => (block, whole),
            })
            .collect();
        Self { blocks }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub(crate) fn contains(&self, tid: ItemPointer) -> bool {
        let Ok(idx) = self.blocks.binary_search_by_key(&tid.block, |(b, _)| *b) else {
            return false;
        };
        match &self.blocks[idx].1 {
            Reaped::Whole => true,
            Reaped::Slots(slots) => slots.binary_search(&tid.slot).is_ok(),
        }
    }
}

fn merge(merged: &mut BTreeMap<BlockNumber, Reaped>, block: BlockNumber, incoming: Reaped) {
    match merged.entry(block) {
        Entry::Vacant(vacant) => {
            vacant.insert(incoming);
        }
        Entry::Occupied(mut occupied) => {
            let existing = occupied.get_mut();
            match incoming {
                Reaped::Whole => *existing = Reaped::Whole,
                Reaped::Slots(more) => {
                    if let Reaped::Slots(slots) = existing {
                        slots.extend(more);
                    }
                }
            }
        }
    }
}

/// Link from a newer version back to the version it superseded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct VtLink {
    pub(crate) new_tid: ItemPointer,
    pub(crate) this_tid: ItemPointer,
}

/// Chain links collected from recently-dead versions, sorted by `new_tid`.
#[derive(Clone, Debug, Default)]
pub(crate) struct VtLinks {
    links: Vec<VtLink>,
    sorted: bool,
}

impl VtLinks {
    pub(crate) fn push(&mut self, new_tid: ItemPointer, this_tid: ItemPointer) {
        self.links.push(VtLink { new_tid, this_tid });
        self.sorted = false;
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.links.clear();
        self.sorted = true;
    }

    pub(crate) fn sort(&mut self) {
        self.links.sort_by_key(|link| link.new_tid);
        self.sorted = true;
    }

    /// Version superseded by the one at `new_tid`.
    pub(crate) fn parent_of(&self, new_tid: ItemPointer) -> Option<ItemPointer> {
        debug_assert!(self.sorted);
        self.links
            .binary_search_by_key(&new_tid, |link| link.new_tid)
            .ok()
            .map(|idx| self.links[idx].this_tid)
    }
}
