#![forbid(unsafe_code)]

//! Secondary indexes over heap row versions.
//!
//! The vacuum engine only needs two things from an index: a bulk delete
//! driven by a "is this heap location reaped?" callback and a cleanup pass
//! that reports statistics. [`OrderedIndex`] is the one access method the
//! crate ships; it is kept in memory and rebuilt from the heap on open.

use std::collections::BTreeSet;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::types::{ItemPointer, RelId, Result, VacError};

/// Index entries assumed to fit on one index page when reporting page counts.
pub const ENTRIES_PER_INDEX_PAGE: u64 = 256;

/// Byte range of the row payload used as the index key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Start of the key inside the payload.
    pub offset: usize,
    /// Key length; payloads shorter than `offset + len` use what is there.
    pub len: usize,
}

impl KeySpec {
    /// Extracts the key from `payload`.
    pub fn extract(&self, payload: &[u8]) -> Vec<u8> {
        let start = self.offset.min(payload.len());
        let end = self.offset.saturating_add(self.len).min(payload.len());
        payload[start..end].to_vec()
    }
}

/// Filter of a partial index: only rows whose payload carries `equals` at
/// `offset` are indexed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPredicate {
    /// Byte offset inside the payload.
    pub offset: usize,
    /// Required bytes.
    pub equals: Vec<u8>,
}

impl IndexPredicate {
    /// Returns true if `payload` satisfies the predicate.
    pub fn matches(&self, payload: &[u8]) -> bool {
        payload
            .get(self.offset..self.offset + self.equals.len())
            .is_some_and(|bytes| bytes == self.equals.as_slice())
    }
}

/// Catalog description of an index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index relation id.
    pub id: RelId,
    /// Index name.
    pub name: String,
    /// Key extraction.
    pub key: KeySpec,
    /// Partial-index filter.
    #[serde(default)]
    pub predicate: Option<IndexPredicate>,
    /// Index enforces the relation's primary key.
    #[serde(default)]
    pub primary: bool,
}

/// Statistics returned by bulk delete and cleanup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IndexBulkDeleteResult {
    /// Pages the index occupies.
    pub num_pages: u64,
    /// Entries remaining.
    pub num_index_tuples: u64,
    /// Entries removed by this call.
    pub tuples_removed: u64,
    /// Pages emptied by this call.
    pub pages_deleted: u64,
    /// Pages that are free for reuse.
    pub pages_free: u64,
}

/// Operations the vacuum engine drives on an index.
pub trait IndexAccessMethod: Send + Sync {
    /// Catalog description.
    fn def(&self) -> &IndexDef;

    /// Returns true for a filtered index that may legitimately hold fewer
    /// entries than the heap has row versions.
    fn is_partial(&self) -> bool {
        self.def().predicate.is_some()
    }

    /// Adds an entry for the row version at `tid`. Returns false when the
    /// row is filtered out by the index predicate.
    fn insert(&self, tid: ItemPointer, payload: &[u8]) -> Result<bool>;

    /// Removes every entry whose heap location satisfies `reaped`.
    fn bulk_delete(&self, reaped: &dyn Fn(ItemPointer) -> bool) -> Result<IndexBulkDeleteResult>;

    /// Post-vacuum cleanup. With no prior bulk-delete result this is a plain
    /// read-only statistics scan.
    fn vacuum_cleanup(
        &self,
        prior: Option<IndexBulkDeleteResult>,
    ) -> Result<IndexBulkDeleteResult>;

    /// Heap locations stored under `key`.
    fn lookup(&self, key: &[u8]) -> Vec<ItemPointer>;

    /// Every heap location in the index, in key order.
    fn tids(&self) -> Vec<ItemPointer>;
}

/// Ordered in-memory index keyed by `(key bytes, heap location)`.
pub struct OrderedIndex {
    def: IndexDef,
    entries: RwLock<BTreeSet<(Vec<u8>, ItemPointer)>>,
    free_pages: RwLock<u64>,
}

impl OrderedIndex {
    /// Empty index for `def`.
    pub fn new(def: IndexDef) -> Self {
        Self {
            def,
            entries: RwLock::new(BTreeSet::new()),
            free_pages: RwLock::new(0),
        }
    }

    fn pages_for(entries: u64) -> u64 {
        entries.div_ceil(ENTRIES_PER_INDEX_PAGE).max(1)
    }

    /// Inserts an entry without consulting the predicate. Used to model a
    /// damaged index in diagnostics.
    pub fn insert_raw(&self, key: Vec<u8>, tid: ItemPointer) {
        self.entries.write().insert((key, tid));
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl IndexAccessMethod for OrderedIndex {
    fn def(&self) -> &IndexDef {
        &self.def
    }

    fn insert(&self, tid: ItemPointer, payload: &[u8]) -> Result<bool> {
        if !tid.is_valid() {
            return Err(VacError::Invalid("index entry needs a valid heap location"));
        }
        if let Some(pred) = &self.def.predicate {
            if !pred.matches(payload) {
                return Ok(false);
            }
        }
        let key = self.def.key.extract(payload);
        self.entries.write().insert((key, tid));
        Ok(true)
    }

    fn bulk_delete(&self, reaped: &dyn Fn(ItemPointer) -> bool) -> Result<IndexBulkDeleteResult> {
        let mut entries = self.entries.write();
        let before = entries.len() as u64;
        let pages_before = Self::pages_for(before);
        entries.retain(|(_, tid)| !reaped(*tid));
        let after = entries.len() as u64;
        let pages_after = Self::pages_for(after);
        let pages_deleted = pages_before - pages_after;
        let mut free = self.free_pages.write();
        *free += pages_deleted;
        trace!(
            index = self.def.id.0,
            removed = before - after,
            "index.bulk_delete"
        );
        Ok(IndexBulkDeleteResult {
            num_pages: pages_after + *free,
            num_index_tuples: after,
            tuples_removed: before - after,
            pages_deleted,
            pages_free: *free,
        })
    }

    fn vacuum_cleanup(
        &self,
        prior: Option<IndexBulkDeleteResult>,
    ) -> Result<IndexBulkDeleteResult> {
        let count = self.entries.read().len() as u64;
        let mut free = self.free_pages.write();
        let recycled = *free;
        *free = 0;
        let mut result = prior.unwrap_or_default();
        result.num_index_tuples = count;
        result.num_pages = Self::pages_for(count);
        result.pages_free = recycled;
        Ok(result)
    }

    fn lookup(&self, key: &[u8]) -> Vec<ItemPointer> {
        let lo = (key.to_vec(), ItemPointer::new(0, 0));
        self.entries
            .read()
            .range(lo..)
            .take_while(|(k, _)| k.as_slice() == key)
            .map(|(_, tid)| *tid)
            .collect()
    }

    fn tids(&self) -> Vec<ItemPointer> {
        self.entries.read().iter().map(|(_, tid)| *tid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(predicate: Option<IndexPredicate>) -> IndexDef {
        IndexDef {
            id: RelId(90),
            name: "t_key".into(),
            key: KeySpec { offset: 0, len: 4 },
            predicate,
            primary: false,
        }
    }

    #[test]
    fn insert_lookup_and_bulk_delete() {
        let idx = OrderedIndex::new(def(None));
        idx.insert(ItemPointer::new(0, 1), b"aaaa-row").unwrap();
        idx.insert(ItemPointer::new(0, 2), b"bbbb-row").unwrap();
        idx.insert(ItemPointer::new(3, 1), b"aaaa-new").unwrap();
        assert_eq!(
            idx.lookup(b"aaaa"),
            vec![ItemPointer::new(0, 1), ItemPointer::new(3, 1)]
        );
        let result = idx.bulk_delete(&|tid| tid.block == 0).unwrap();
        assert_eq!(result.tuples_removed, 2);
        assert_eq!(result.num_index_tuples, 1);
        assert_eq!(idx.tids(), vec![ItemPointer::new(3, 1)]);
        let cleaned = idx.vacuum_cleanup(None).unwrap();
        assert_eq!(cleaned.num_index_tuples, 1);
        assert_eq!(cleaned.num_pages, 1);
    }

    #[test]
    fn partial_index_filters_rows() {
        let idx = OrderedIndex::new(def(Some(IndexPredicate {
            offset: 4,
            equals: b"!".to_vec(),
        })));
        assert!(idx.is_partial());
        assert!(idx.insert(ItemPointer::new(0, 1), b"key1!").unwrap());
        assert!(!idx.insert(ItemPointer::new(0, 2), b"key2?").unwrap());
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn page_accounting_tracks_shrinkage() {
        let idx = OrderedIndex::new(def(None));
        for slot in 1..=600u16 {
            idx.insert(ItemPointer::new(1, slot), &slot.to_be_bytes())
                .unwrap();
        }
        let result = idx.bulk_delete(&|tid| tid.slot > 10).unwrap();
        assert_eq!(result.pages_deleted, 2);
        assert_eq!(result.num_pages, 3);
        let cleaned = idx.vacuum_cleanup(Some(result)).unwrap();
        assert_eq!(cleaned.num_pages, 1);
        assert_eq!(cleaned.pages_free, 2);
        assert_eq!(cleaned.tuples_removed, 590);
    }
}
