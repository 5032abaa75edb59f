#![forbid(unsafe_code)]

//! Row-version header stored in front of every tuple payload.

use std::fmt;

use crate::types::{ItemPointer, Result, VacError, Xid};

/// Encoded header length in bytes.
pub const TUPLE_HEADER_LEN: usize = 24;

/// Status bits cached in a tuple header.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InfoMask(pub u16);

impl InfoMask {
    /// Creator known committed.
    pub const XMIN_COMMITTED: InfoMask = InfoMask(0x0100);
    /// Creator known aborted (version never existed).
    pub const XMIN_INVALID: InfoMask = InfoMask(0x0200);
    /// Deleter known committed.
    pub const XMAX_COMMITTED: InfoMask = InfoMask(0x0400);
    /// Deleter absent or known aborted.
    pub const XMAX_INVALID: InfoMask = InfoMask(0x0800);
    /// Deleter only locked the row.
    pub const MARKED_FOR_UPDATE: InfoMask = InfoMask(0x1000);
    /// Version was produced by an update of an older version.
    pub const UPDATED: InfoMask = InfoMask(0x2000);
    /// Version is being moved away by the compactor named in `xvac`.
    pub const MOVED_OFF: InfoMask = InfoMask(0x4000);
    /// Version was moved here by the compactor named in `xvac`.
    pub const MOVED_IN: InfoMask = InfoMask(0x8000);
    /// Either relocation marker.
    pub const MOVED: InfoMask = InfoMask(0x4000 | 0x8000);

    /// Returns true if any bit of `other` is set.
    pub fn intersects(self, other: InfoMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if all bits of `other` are set.
    pub fn contains(self, other: InfoMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: InfoMask) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: InfoMask) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for InfoMask {
    type Output = InfoMask;

    fn bitor(self, rhs: InfoMask) -> InfoMask {
        InfoMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for InfoMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(InfoMask, &str); 8] = [
            (InfoMask::XMIN_COMMITTED, "XMIN_COMMITTED"),
            (InfoMask::XMIN_INVALID, "XMIN_INVALID"),
            (InfoMask::XMAX_COMMITTED, "XMAX_COMMITTED"),
            (InfoMask::XMAX_INVALID, "XMAX_INVALID"),
            (InfoMask::MARKED_FOR_UPDATE, "MARKED_FOR_UPDATE"),
            (InfoMask::UPDATED, "UPDATED"),
            (InfoMask::MOVED_OFF, "MOVED_OFF"),
            (InfoMask::MOVED_IN, "MOVED_IN"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

/// Decoded tuple header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TupleHeader {
    /// Creating transaction.
    pub xmin: Xid,
    /// Deleting (or locking) transaction, `INVALID` if none.
    pub xmax: Xid,
    /// Compactor transaction that relocated the version.
    pub xvac: Xid,
    /// Self for the newest version of a row, else the next version.
    pub ctid: ItemPointer,
    /// Cached status bits.
    pub infomask: InfoMask,
}

impl TupleHeader {
    /// Header for a freshly inserted version at `tid`.
    pub fn for_insert(xmin: Xid, tid: ItemPointer) -> Self {
        Self {
            xmin,
            xmax: Xid::INVALID,
            xvac: Xid::INVALID,
            ctid: tid,
            infomask: InfoMask::XMAX_INVALID,
        }
    }

    /// Returns true if `ctid` points back at `tid`.
    pub fn is_chain_tail_at(&self, tid: ItemPointer) -> bool {
        self.ctid == tid
    }

    /// Returns true if the version has a real (non-lock) deleter recorded.
    pub fn has_deleter(&self) -> bool {
        !self
            .infomask
            .intersects(InfoMask::XMAX_INVALID | InfoMask::MARKED_FOR_UPDATE)
    }

    /// Writes the header into the first [`TUPLE_HEADER_LEN`] bytes of `dst`.
    pub fn encode_into(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < TUPLE_HEADER_LEN {
            return Err(VacError::Invalid("tuple buffer shorter than header"));
        }
        dst[0..4].copy_from_slice(&self.xmin.0.to_be_bytes());
        dst[4..8].copy_from_slice(&self.xmax.0.to_be_bytes());
        dst[8..12].copy_from_slice(&self.xvac.0.to_be_bytes());
        dst[12..16].copy_from_slice(&self.ctid.block.to_be_bytes());
        dst[16..18].copy_from_slice(&self.ctid.slot.to_be_bytes());
        dst[18..20].copy_from_slice(&self.infomask.0.to_be_bytes());
        dst[20..24].fill(0);
        Ok(())
    }

    /// Parses a header from the front of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < TUPLE_HEADER_LEN {
            return Err(VacError::Corruption("tuple shorter than header"));
        }
        let u32_at = |at: usize| -> Result<u32> {
            let bytes: [u8; 4] = src[at..at + 4]
                .try_into()
                .map_err(|_| VacError::Corruption("tuple header field"))?;
            Ok(u32::from_be_bytes(bytes))
        };
        let u16_at = |at: usize| -> Result<u16> {
            let bytes: [u8; 2] = src[at..at + 2]
                .try_into()
                .map_err(|_| VacError::Corruption("tuple header field"))?;
            Ok(u16::from_be_bytes(bytes))
        };
        Ok(Self {
            xmin: Xid(u32_at(0)?),
            xmax: Xid(u32_at(4)?),
            xvac: Xid(u32_at(8)?),
            ctid: ItemPointer::new(u32_at(12)?, u16_at(16)?),
            infomask: InfoMask(u16_at(18)?),
        })
    }
}

/// Encodes a complete tuple image (header followed by payload).
pub fn encode_tuple(header: &TupleHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; TUPLE_HEADER_LEN + payload.len()];
    header.encode_into(&mut buf)?;
    buf[TUPLE_HEADER_LEN..].copy_from_slice(payload);
    Ok(buf)
}

/// Payload part of an encoded tuple.
pub fn tuple_payload(image: &[u8]) -> &[u8] {
    image.get(TUPLE_HEADER_LEN..).unwrap_or(&[])
}
