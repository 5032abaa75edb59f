#![forbid(unsafe_code)]

//! Slotted heap page.
//!
//! The in-memory form keeps tuple bytes in an owned page-sized buffer, growing
//! downward from the end, and the slot directory in a separate vector. The
//! on-disk form packs header and slot directory in front of the tuple area and
//! carries a checksum bound to the page's relation and block number.

use crate::storage::tuple::{TupleHeader, TUPLE_HEADER_LEN};
use crate::types::{max_align, page_crc32, Lsn, Result, SlotNo, VacError, FIRST_SLOT};

/// Encoded page header length.
pub const PAGE_HEADER_LEN: usize = 24;
/// Encoded slot descriptor length.
pub const ITEM_ID_LEN: usize = 4;
/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: usize = 8192;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;
/// Largest supported page size (slot offsets are 15-bit).
pub const MAX_PAGE_SIZE: usize = 32768;

const FLAG_INITIALIZED: u16 = 0x0001;
const ITEM_USED_BIT: u16 = 0x8000;

/// Slot descriptor: where a tuple lives on the page and whether it is in use.
///
/// A slot that is not used but still has a length owns storage that has not
/// been compacted yet; only slots with `len == 0` can be handed out again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemId {
    /// Byte offset of the tuple inside the page.
    pub offset: u16,
    /// Tuple length in bytes.
    pub len: u16,
    /// Slot holds a tuple.
    pub used: bool,
}

impl ItemId {
    fn is_reusable(&self) -> bool {
        !self.used && self.len == 0
    }
}

/// Heap page with stable one-based slot numbers.
#[derive(Clone, Debug)]
pub struct HeapPage {
    buf: Box<[u8]>,
    slots: Vec<ItemId>,
    upper: usize,
    lsn: Lsn,
    initialized: bool,
}

impl HeapPage {
    /// Empty, initialized page.
    pub fn new(page_size: usize) -> Self {
        Self {
            buf: vec![0u8; page_size].into_boxed_slice(),
            slots: Vec::new(),
            upper: page_size,
            lsn: Lsn(0),
            initialized: true,
        }
    }

    /// All-zero page as found after an interrupted relation extension.
    pub fn uninitialized(page_size: usize) -> Self {
        Self {
            initialized: false,
            ..Self::new(page_size)
        }
    }

    /// Resets the page to the empty, initialized state.
    pub fn init(&mut self) {
        self.buf.fill(0);
        self.slots.clear();
        self.upper = self.buf.len();
        self.initialized = true;
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.buf.len()
    }

    /// True for a page that was never initialized.
    pub fn is_new(&self) -> bool {
        !self.initialized
    }

    /// True when the slot directory is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Highest slot number on the page (zero when there are none).
    pub fn max_slot(&self) -> SlotNo {
        self.slots.len() as SlotNo
    }

    /// Iterator over every slot number on the page.
    pub fn slot_numbers(&self) -> impl Iterator<Item = SlotNo> {
        FIRST_SLOT..=self.max_slot()
    }

    /// Log position of the last logged change to this page.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Records the log position of a change.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.lsn = lsn;
    }

    fn lower(&self) -> usize {
        PAGE_HEADER_LEN + self.slots.len() * ITEM_ID_LEN
    }

    /// Contiguous hole between slot directory and tuple area.
    pub fn raw_free_space(&self) -> usize {
        self.upper.saturating_sub(self.lower())
    }

    /// Space usable for one more tuple, accounting for its slot descriptor.
    pub fn free_space(&self) -> usize {
        self.raw_free_space().saturating_sub(ITEM_ID_LEN)
    }

    fn slot_index(&self, slot: SlotNo) -> Option<usize> {
        if slot < FIRST_SLOT || slot > self.max_slot() {
            None
        } else {
            Some(usize::from(slot - FIRST_SLOT))
        }
    }

    /// Slot descriptor, if the slot number exists.
    pub fn item_id(&self, slot: SlotNo) -> Option<ItemId> {
        self.slot_index(slot).map(|idx| self.slots[idx])
    }

    /// True if the slot exists and holds a tuple.
    pub fn is_used(&self, slot: SlotNo) -> bool {
        self.item_id(slot).is_some_and(|item| item.used)
    }

    /// Tuple bytes of a used slot.
    pub fn item(&self, slot: SlotNo) -> Option<&[u8]> {
        let item = self.item_id(slot)?;
        if !item.used {
            return None;
        }
        let start = usize::from(item.offset);
        self.buf.get(start..start + usize::from(item.len))
    }

    fn item_mut(&mut self, slot: SlotNo) -> Option<&mut [u8]> {
        let item = self.item_id(slot)?;
        if !item.used {
            return None;
        }
        let start = usize::from(item.offset);
        self.buf.get_mut(start..start + usize::from(item.len))
    }

    /// Decoded header of the tuple in `slot`.
    pub fn header(&self, slot: SlotNo) -> Result<TupleHeader> {
        let bytes = self
            .item(slot)
            .ok_or(VacError::Invalid("slot is not in use"))?;
        TupleHeader::decode(bytes)
    }

    /// Overwrites the header of the tuple in `slot`.
    pub fn set_header(&mut self, slot: SlotNo, header: &TupleHeader) -> Result<()> {
        let bytes = self
            .item_mut(slot)
            .ok_or(VacError::Invalid("slot is not in use"))?;
        header.encode_into(bytes)
    }

    /// Adds a tuple image, reusing a deallocated slot when one exists.
    /// Returns `None` when the page has no room.
    pub fn add_item(&mut self, image: &[u8]) -> Option<SlotNo> {
        if image.len() < TUPLE_HEADER_LEN || image.len() >= MAX_PAGE_SIZE {
            return None;
        }
        let aligned = max_align(image.len());
        let reuse = self.slots.iter().position(ItemId::is_reusable);
        let lower_after = if reuse.is_some() {
            self.lower()
        } else {
            self.lower() + ITEM_ID_LEN
        };
        if lower_after + aligned > self.upper {
            return None;
        }
        let new_upper = self.upper - aligned;
        self.buf[new_upper..new_upper + image.len()].copy_from_slice(image);
        self.buf[new_upper + image.len()..self.upper].fill(0);
        self.upper = new_upper;
        let item = ItemId {
            offset: new_upper as u16,
            len: image.len() as u16,
            used: true,
        };
        let idx = match reuse {
            Some(idx) => {
                self.slots[idx] = item;
                idx
            }
            None => {
                self.slots.push(item);
                self.slots.len() - 1
            }
        };
        Some(idx as SlotNo + FIRST_SLOT)
    }

    /// Marks a slot unused. Its storage is reclaimed by the next
    /// [`HeapPage::repair_fragmentation`].
    pub fn unuse(&mut self, slot: SlotNo) -> bool {
        match self.slot_index(slot) {
            Some(idx) => {
                let was_used = self.slots[idx].used;
                self.slots[idx].used = false;
                was_used
            }
            None => false,
        }
    }

    /// Returns true if compaction would not change the page: every unused
    /// slot is deallocated and used tuples are packed against the end.
    pub fn is_compacted(&self) -> bool {
        if self.slots.iter().any(|item| !item.used && item.len != 0) {
            return false;
        }
        let used: usize = self
            .slots
            .iter()
            .filter(|item| item.used)
            .map(|item| max_align(usize::from(item.len)))
            .sum();
        self.upper == self.buf.len() - used
    }

    /// Compacts used tuples toward the end of the page, deallocates every
    /// unused slot and returns the unused slot numbers.
    pub fn repair_fragmentation(&mut self) -> Vec<SlotNo> {
        let page_size = self.buf.len();
        let mut live: Vec<(usize, Vec<u8>)> = Vec::new();
        let mut unused = Vec::new();
        for (idx, item) in self.slots.iter().enumerate() {
            if item.used {
                let start = usize::from(item.offset);
                live.push((idx, self.buf[start..start + usize::from(item.len)].to_vec()));
            } else {
                unused.push(idx as SlotNo + FIRST_SLOT);
            }
        }
        live.sort_by_key(|(idx, _)| std::cmp::Reverse(self.slots[*idx].offset));
        let lower = self.lower();
        self.buf[lower..].fill(0);
        let mut upper = page_size;
        for (idx, bytes) in live {
            upper -= max_align(bytes.len());
            self.buf[upper..upper + bytes.len()].copy_from_slice(&bytes);
            self.slots[idx].offset = upper as u16;
        }
        for item in self.slots.iter_mut().filter(|item| !item.used) {
            item.offset = 0;
            item.len = 0;
        }
        self.upper = upper;
        unused
    }

    /// Encodes the page for block `block` of relation `rel`.
    pub fn encode(&self, rel: u32, block: u32) -> Vec<u8> {
        let mut out = self.buf.to_vec();
        if !self.initialized {
            out.fill(0);
            return out;
        }
        out[0..PAGE_HEADER_LEN].fill(0);
        out[0..8].copy_from_slice(&self.lsn.0.to_be_bytes());
        out[8..10].copy_from_slice(&FLAG_INITIALIZED.to_be_bytes());
        out[10..12].copy_from_slice(&(self.slots.len() as u16).to_be_bytes());
        out[12..14].copy_from_slice(&(self.upper as u16).to_be_bytes());
        for (idx, item) in self.slots.iter().enumerate() {
            let at = PAGE_HEADER_LEN + idx * ITEM_ID_LEN;
            let len = if item.used {
                item.len | ITEM_USED_BIT
            } else {
                item.len
            };
            out[at..at + 2].copy_from_slice(&item.offset.to_be_bytes());
            out[at + 2..at + 4].copy_from_slice(&len.to_be_bytes());
        }
        let crc = page_crc32(rel, block, &out);
        out[16..20].copy_from_slice(&crc.to_be_bytes());
        out
    }

    /// Decodes an on-disk image of block `block` of relation `rel`.
    pub fn decode(rel: u32, block: u32, image: &[u8]) -> Result<Self> {
        let page_size = image.len();
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(VacError::Invalid("unsupported page size"));
        }
        if image.iter().all(|b| *b == 0) {
            return Ok(Self::uninitialized(page_size));
        }
        let read_u16 = |at: usize| u16::from_be_bytes([image[at], image[at + 1]]);
        let mut lsn_bytes = [0u8; 8];
        lsn_bytes.copy_from_slice(&image[0..8]);
        let flags = read_u16(8);
        if flags & FLAG_INITIALIZED == 0 {
            return Err(VacError::Corruption("page flags missing initialized bit"));
        }
        let stored_crc = u32::from_be_bytes([image[16], image[17], image[18], image[19]]);
        let mut scratch = image.to_vec();
        scratch[16..20].fill(0);
        if page_crc32(rel, block, &scratch) != stored_crc {
            return Err(VacError::Corruption("page checksum mismatch"));
        }
        let nslots = usize::from(read_u16(10));
        let upper = usize::from(read_u16(12));
        let lower = PAGE_HEADER_LEN + nslots * ITEM_ID_LEN;
        if lower > upper || upper > page_size {
            return Err(VacError::Corruption("page bounds out of range"));
        }
        let mut slots = Vec::with_capacity(nslots);
        for idx in 0..nslots {
            let at = PAGE_HEADER_LEN + idx * ITEM_ID_LEN;
            let offset = read_u16(at);
            let raw_len = read_u16(at + 2);
            let item = ItemId {
                offset,
                len: raw_len & !ITEM_USED_BIT,
                used: raw_len & ITEM_USED_BIT != 0,
            };
            if item.len != 0
                && (usize::from(item.offset) < upper
                    || usize::from(item.offset) + usize::from(item.len) > page_size)
            {
                return Err(VacError::Corruption("slot points outside tuple area"));
            }
            slots.push(item);
        }
        let mut buf = image.to_vec().into_boxed_slice();
        buf[..upper].fill(0);
        Ok(Self {
            buf,
            slots,
            upper,
            lsn: Lsn(u64::from_be_bytes(lsn_bytes)),
            initialized: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tuple::encode_tuple;
    use crate::types::{ItemPointer, Xid};

    fn tuple(slot: SlotNo, payload_len: usize) -> Vec<u8> {
        let header = TupleHeader::for_insert(Xid(5), ItemPointer::new(0, slot));
        encode_tuple(&header, &vec![0xAB; payload_len]).unwrap()
    }

    #[test]
    fn add_and_read_back() {
        let mut page = HeapPage::new(1024);
        assert!(page.is_empty());
        let slot = page.add_item(&tuple(1, 10)).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(page.header(slot).unwrap().xmin, Xid(5));
        assert_eq!(page.item(slot).unwrap().len(), TUPLE_HEADER_LEN + 10);
        assert_eq!(
            page.raw_free_space(),
            1024 - PAGE_HEADER_LEN - ITEM_ID_LEN - max_align(TUPLE_HEADER_LEN + 10)
        );
    }

    #[test]
    fn unused_slot_is_reused_only_after_repair() {
        let mut page = HeapPage::new(1024);
        let a = page.add_item(&tuple(1, 8)).unwrap();
        let b = page.add_item(&tuple(2, 8)).unwrap();
        assert!(page.unuse(a));
        let c = page.add_item(&tuple(3, 8)).unwrap();
        assert_eq!(c, 3);
        assert!(!page.is_compacted());
        let unused = page.repair_fragmentation();
        assert_eq!(unused, vec![a]);
        assert!(page.is_compacted());
        assert!(page.is_used(b));
        assert_eq!(page.add_item(&tuple(4, 8)).unwrap(), a);
    }

    #[test]
    fn repair_keeps_slot_numbers_and_bytes() {
        let mut page = HeapPage::new(2048);
        let slots: Vec<_> = (0..5).map(|i| page.add_item(&tuple(i + 1, 40)).unwrap()).collect();
        let keep = page.item(slots[3]).unwrap().to_vec();
        let before = page.raw_free_space();
        page.unuse(slots[0]);
        page.unuse(slots[2]);
        page.repair_fragmentation();
        assert_eq!(page.item(slots[3]).unwrap(), keep.as_slice());
        assert_eq!(page.max_slot(), 5);
        assert_eq!(
            page.raw_free_space(),
            before + 2 * max_align(TUPLE_HEADER_LEN + 40)
        );
    }

    #[test]
    fn full_page_rejects_items() {
        let mut page = HeapPage::new(MIN_PAGE_SIZE);
        let mut added = 0;
        while page.add_item(&tuple(1, 64)).is_some() {
            added += 1;
        }
        assert!(added > 0);
        assert!(page.free_space() < max_align(TUPLE_HEADER_LEN + 64));
    }

    #[test]
    fn encode_decode_roundtrip_and_checksum() {
        let mut page = HeapPage::new(1024);
        page.add_item(&tuple(1, 12)).unwrap();
        let gone = page.add_item(&tuple(2, 12)).unwrap();
        page.unuse(gone);
        page.set_lsn(Lsn(99));
        let image = page.encode(7, 3);
        let decoded = HeapPage::decode(7, 3, &image).unwrap();
        assert_eq!(decoded.lsn(), Lsn(99));
        assert_eq!(decoded.max_slot(), 2);
        assert!(!decoded.is_used(gone));
        assert_eq!(decoded.encode(7, 3), image);
        assert!(matches!(
            HeapPage::decode(7, 4, &image),
            Err(VacError::Corruption(_))
        ));
    }

    #[test]
    fn zero_image_decodes_as_new_page() {
        let page = HeapPage::decode(1, 0, &vec![0u8; 1024]).unwrap();
        assert!(page.is_new());
        let mut page = page;
        page.init();
        assert!(!page.is_new());
        assert!(page.is_empty());
    }
}
