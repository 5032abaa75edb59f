#![forbid(unsafe_code)]

//! Publishing free space found by vacuum to the shared directory.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tracing::debug;

use crate::storage::fsm::FreeSpaceEntry;
use crate::types::BlockNumber;
use crate::vacuum::pagelist::VacPage;
use crate::vacuum::RelationPass;

/// Replaces the relation's directory entries with the target pages below
/// `rel_pages` that can satisfy an average request.
pub(crate) fn publish_target_pages<'a>(
    pass: &RelationPass<'_>,
    targets: impl IntoIterator<Item = &'a VacPage>,
    rel_pages: BlockNumber,
) -> usize {
    let rel = pass.rel();
    let threshold = pass.fsm().avg_request_size(rel);
    let entries: Vec<FreeSpaceEntry> = targets
        .into_iter()
        .take_while(|page| page.blkno < rel_pages)
        .filter(|page| page.free >= threshold)
        .map(|page| FreeSpaceEntry {
            block: page.blkno,
            avail: page.free,
        })
        .collect();
    let published = entries.len();
    pass.fsm().record_relation_free_space(rel, entries);
    debug!(rel = rel.0, published, threshold, "vacuum.fsm.published");
    published
}

/// Bounded collection keeping the pages with the most free space, used by
/// lazy vacuum while it scans.
#[derive(Debug)]
pub(crate) struct FreeSpaceCollector {
    capacity: usize,
    threshold: usize,
    heap: BinaryHeap<Reverse<(usize, Reverse<BlockNumber>)>>,
}

impl FreeSpaceCollector {
    pub(crate) fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            capacity,
            threshold,
            heap: BinaryHeap::with_capacity(capacity.min(1024)),
        }
    }

    /// Offers a page; pages below the threshold are ignored.
    pub(crate) fn record(&mut self, block: BlockNumber, avail: usize) {
        if avail < self.threshold || self.capacity == 0 {
            return;
        }
        let entry = Reverse((avail, Reverse(block)));
        if self.heap.len() < self.capacity {
            self.heap.push(entry);
            return;
        }
        if let Some(smallest) = self.heap.peek() {
            if entry < *smallest {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    /// Kept entries below `rel_pages`, by block.
    pub(crate) fn into_entries(self, rel_pages: BlockNumber) -> Vec<FreeSpaceEntry> {
        let mut entries: Vec<FreeSpaceEntry> = self
            .heap
            .into_iter()
            .map(|Reverse((avail, Reverse(block)))| FreeSpaceEntry { block, avail })
            .filter(|entry| entry.block < rel_pages)
            .collect();
        entries.sort_by_key(|entry| entry.block);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_keeps_the_largest_pages() {
        let mut fsm = FreeSpaceCollector::new(2, 100);
        fsm.record(0, 50);
        fsm.record(1, 300);
        fsm.record(2, 200);
        fsm.record(3, 400);
        fsm.record(4, 250);
        let entries = fsm.into_entries(10);
        assert_eq!(
            entries,
            vec![
                FreeSpaceEntry { block: 1, avail: 300 },
                FreeSpaceEntry { block: 3, avail: 400 },
            ]
        );
    }

    #[test]
    fn collector_drops_truncated_pages() {
        let mut fsm = FreeSpaceCollector::new(8, 0);
        for block in 0..5 {
            fsm.record(block, 100 + block as usize);
        }
        let blocks: Vec<_> = fsm.into_entries(3).iter().map(|e| e.block).collect();
        assert_eq!(blocks, vec![0, 1, 2]);
    }
}
