#![forbid(unsafe_code)]

//! Core identifiers, error type and helpers shared across the crate.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod checksum;

pub use checksum::{crc32_of, page_crc32, Checksum, Crc32Fast};

/// Block (page) number inside a relation file.
pub type BlockNumber = u32;

/// Sentinel block number meaning "no block".
pub const INVALID_BLOCK: BlockNumber = u32::MAX;

/// One-based slot number inside a page. Zero is never a valid slot.
pub type SlotNo = u16;

/// First slot number handed out on a page.
pub const FIRST_SLOT: SlotNo = 1;

/// Log sequence number assigned to every write-ahead log record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relation identifier (tables, overflow tables and indexes share the space).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelId(pub u32);

impl fmt::Display for RelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Database identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DbId(pub u32);

/// Role (user) identifier used for ownership checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleId(pub u32);

/// Identifier of a client session; lock ownership and temp tables hang off it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

/// 32-bit transaction identifier compared on a circle.
///
/// Ids below [`Xid::FIRST_NORMAL`] are permanent markers and compare as plain
/// integers. Normal ids compare modulo 2^32 so that an id is "older" than the
/// roughly two billion ids that follow it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid(pub u32);

impl Xid {
    /// No transaction.
    pub const INVALID: Xid = Xid(0);
    /// Transaction that created the initial catalog.
    pub const BOOTSTRAP: Xid = Xid(1);
    /// Creator id given to versions visible to every transaction.
    pub const FROZEN: Xid = Xid(2);
    /// First id handed to a real transaction.
    pub const FIRST_NORMAL: Xid = Xid(3);
    /// Largest representable id.
    pub const MAX_RAW: u32 = u32::MAX;

    /// Returns true unless this is [`Xid::INVALID`].
    pub fn is_valid(self) -> bool {
        self != Xid::INVALID
    }

    /// Returns true for ids assigned to real transactions.
    pub fn is_normal(self) -> bool {
        self.0 >= Xid::FIRST_NORMAL.0
    }

    /// Circular "strictly older than".
    pub fn precedes(self, other: Xid) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Circular "older than or equal to".
    pub fn precedes_or_equals(self, other: Xid) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 <= other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) <= 0
    }

    /// Circular "strictly newer than".
    pub fn follows(self, other: Xid) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 > other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) > 0
    }

    /// Circular "newer than or equal to".
    pub fn follows_or_equals(self, other: Xid) -> bool {
        !self.precedes(other)
    }

    /// Next id in assignment order, skipping the permanent markers on wrap.
    pub fn next(self) -> Xid {
        let raw = self.0.wrapping_add(1);
        if raw < Xid::FIRST_NORMAL.0 {
            Xid::FIRST_NORMAL
        } else {
            Xid(raw)
        }
    }

    /// Id `distance` steps before this one on the circle. The result may be
    /// a permanent marker; callers clamp where that matters.
    pub fn wrapping_back(self, distance: u32) -> Xid {
        Xid(self.0.wrapping_sub(distance))
    }

    /// Signed circular distance `self - older`.
    pub fn age_since(self, older: Xid) -> i32 {
        self.0.wrapping_sub(older.0) as i32
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical location of a row version: block number and slot number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemPointer {
    /// Block holding the version.
    pub block: BlockNumber,
    /// Slot inside the block.
    pub slot: SlotNo,
}

impl ItemPointer {
    /// Pointer that names no location.
    pub const INVALID: ItemPointer = ItemPointer {
        block: INVALID_BLOCK,
        slot: 0,
    };

    /// Builds a pointer from its parts.
    pub const fn new(block: BlockNumber, slot: SlotNo) -> Self {
        Self { block, slot }
    }

    /// Returns true if the pointer names a real slot.
    pub fn is_valid(&self) -> bool {
        self.slot != 0 && self.block != INVALID_BLOCK
    }
}

impl fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.slot)
    }
}

/// Errors raised by the storage layer and the vacuum engine.
#[derive(Debug, Error)]
pub enum VacError {
    /// Underlying file or OS failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// On-disk bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller passed an invalid argument or state.
    #[error("invalid: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a formatted message.
    #[error("invalid: {0}")]
    InvalidOwned(String),
    /// Requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Engine invariant violated; aborts the current unit of work.
    #[error("integrity check failed: {0}")]
    Integrity(String),
    /// A lock could not be granted in time.
    #[error("lock timeout on relation {rel}")]
    LockTimeout {
        /// Relation the lock was requested on.
        rel: RelId,
    },
    /// Row version changed underneath a writer.
    #[error("row version {0} was concurrently updated")]
    ConcurrentUpdate(ItemPointer),
    /// Work was cancelled through a cancellation token.
    #[error("operation cancelled")]
    Cancelled,
    /// Catalog or history file could not be (de)serialized.
    #[error("serialization: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for VacError {
    fn from(err: serde_json::Error) -> Self {
        VacError::Serde(err.to_string())
    }
}

impl VacError {
    /// Returns true for errors that abort a relation's unit of work without
    /// poisoning the surrounding database-wide run.
    pub fn is_relation_local(&self) -> bool {
        matches!(
            self,
            VacError::Integrity(_) | VacError::ConcurrentUpdate(_) | VacError::LockTimeout { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VacError>;

/// Rounds `len` up to the 8-byte alignment used for tuple storage.
pub const fn max_align(len: usize) -> usize {
    (len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xid_circular_ordering() {
        let a = Xid(10);
        let b = Xid(20);
        assert!(a.precedes(b));
        assert!(b.follows(a));
        assert!(!b.precedes(a));

        let near_max = Xid(u32::MAX - 5);
        let wrapped = near_max.next().next().next().next().next().next().next();
        assert!(wrapped.is_normal());
        assert!(near_max.precedes(wrapped));
        assert!(wrapped.follows(near_max));
    }

    #[test]
    fn permanent_ids_precede_normal_ids() {
        assert!(Xid::FROZEN.precedes(Xid(5)));
        assert!(Xid::BOOTSTRAP.precedes(Xid(u32::MAX)));
        assert!(!Xid(7).precedes(Xid::FROZEN));
    }

    #[test]
    fn next_skips_special_ids() {
        assert_eq!(Xid(u32::MAX).next(), Xid::FIRST_NORMAL);
        assert_eq!(Xid(3).next(), Xid(4));
    }

    #[test]
    fn item_pointer_orders_by_block_then_slot() {
        let mut tids = vec![
            ItemPointer::new(2, 1),
            ItemPointer::new(1, 9),
            ItemPointer::new(1, 2),
        ];
        tids.sort();
        assert_eq!(
            tids,
            vec![
                ItemPointer::new(1, 2),
                ItemPointer::new(1, 9),
                ItemPointer::new(2, 1)
            ]
        );
        assert!(!ItemPointer::INVALID.is_valid());
    }

    #[test]
    fn max_align_rounds_up() {
        assert_eq!(max_align(0), 0);
        assert_eq!(max_align(1), 8);
        assert_eq!(max_align(24), 24);
        assert_eq!(max_align(25), 32);
    }
}
