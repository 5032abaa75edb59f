#![forbid(unsafe_code)]

//! Write-ahead log for heap page changes and transaction outcomes.
//!
//! Every record is one checksummed frame. Page-changing records carry the
//! full post-change page image, so redo is "install the image unless the
//! stored page already has an equal or newer LSN".

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::{
    crc32_of, BlockNumber, ItemPointer, Lsn, RelId, Result, SlotNo, VacError, Xid,
};

const WAL_MAGIC: [u8; 4] = *b"HVWL";
const WAL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 24;
const FRAME_HEADER_LEN: usize = 24;

const KIND_HEAP_WRITE: u8 = 1;
const KIND_CLEAN: u8 = 2;
const KIND_MOVE: u8 = 3;
const KIND_COMMIT: u8 = 4;
const KIND_ABORT: u8 = 5;
const KIND_TRUNCATE: u8 = 6;
const KIND_CLOG_TRUNCATE: u8 = 7;

/// Post-change image of one page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageImage {
    /// Block the image belongs to.
    pub block: BlockNumber,
    /// Encoded page bytes.
    pub bytes: Vec<u8>,
}

/// One logged change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalRecord {
    /// Full page image: a regular write, or hint and freeze updates made by
    /// vacuum.
    HeapWrite {
        /// Relation written.
        rel: RelId,
        /// Page after the write.
        page: PageImage,
    },
    /// In-place reap: the listed slots became unused and the page was compacted.
    Clean {
        /// Relation cleaned.
        rel: RelId,
        /// Slots that are unused after the clean.
        unused: Vec<SlotNo>,
        /// Page after the clean.
        page: PageImage,
    },
    /// Relocation of one row version; one or two page images.
    Move {
        /// Relation compacted.
        rel: RelId,
        /// Old location (now moved-out).
        from: ItemPointer,
        /// New location (moved-in).
        to: ItemPointer,
        /// Source and destination pages after the move.
        pages: Vec<PageImage>,
    },
    /// Transaction committed.
    Commit {
        /// Transaction id.
        xid: Xid,
    },
    /// Transaction aborted.
    Abort {
        /// Transaction id.
        xid: Xid,
    },
    /// Relation file shortened.
    Truncate {
        /// Relation truncated.
        rel: RelId,
        /// New length in blocks.
        nblocks: BlockNumber,
    },
    /// Transaction-status history below `oldest` discarded.
    ClogTruncate {
        /// Oldest id whose status is still retained.
        oldest: Xid,
    },
}

impl WalRecord {
    fn kind(&self) -> u8 {
        match self {
            WalRecord::HeapWrite { .. } => KIND_HEAP_WRITE,
            WalRecord::Clean { .. } => KIND_CLEAN,
            WalRecord::Move { .. } => KIND_MOVE,
            WalRecord::Commit { .. } => KIND_COMMIT,
            WalRecord::Abort { .. } => KIND_ABORT,
            WalRecord::Truncate { .. } => KIND_TRUNCATE,
            WalRecord::ClogTruncate { .. } => KIND_CLOG_TRUNCATE,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            WalRecord::HeapWrite { rel, page } => {
                out.extend_from_slice(&rel.0.to_be_bytes());
                put_image(&mut out, page);
            }
            WalRecord::Clean { rel, unused, page } => {
                out.extend_from_slice(&rel.0.to_be_bytes());
                out.extend_from_slice(&(unused.len() as u32).to_be_bytes());
                for slot in unused {
                    out.extend_from_slice(&slot.to_be_bytes());
                }
                put_image(&mut out, page);
            }
            WalRecord::Move {
                rel,
                from,
                to,
                pages,
            } => {
                out.extend_from_slice(&rel.0.to_be_bytes());
                put_tid(&mut out, from);
                put_tid(&mut out, to);
                out.push(pages.len() as u8);
                for page in pages {
                    put_image(&mut out, page);
                }
            }
            WalRecord::Commit { xid } | WalRecord::Abort { xid } => {
                out.extend_from_slice(&xid.0.to_be_bytes());
            }
            WalRecord::Truncate { rel, nblocks } => {
                out.extend_from_slice(&rel.0.to_be_bytes());
                out.extend_from_slice(&nblocks.to_be_bytes());
            }
            WalRecord::ClogTruncate { oldest } => {
                out.extend_from_slice(&oldest.0.to_be_bytes());
            }
        }
        out
    }

    fn decode_payload(kind: u8, src: &[u8]) -> Result<Self> {
        let mut cur = Cursor { src, pos: 0 };
        let record = match kind {
            KIND_HEAP_WRITE => WalRecord::HeapWrite {
                rel: RelId(cur.u32()?),
                page: cur.image()?,
            },
            KIND_CLEAN => {
                let rel = RelId(cur.u32()?);
                let count = cur.u32()? as usize;
                let mut unused = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    unused.push(cur.u16()?);
                }
                WalRecord::Clean {
                    rel,
                    unused,
                    page: cur.image()?,
                }
            }
            KIND_MOVE => {
                let rel = RelId(cur.u32()?);
                let from = cur.tid()?;
                let to = cur.tid()?;
                let count = cur.u8()?;
                let mut pages = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    pages.push(cur.image()?);
                }
                WalRecord::Move {
                    rel,
                    from,
                    to,
                    pages,
                }
            }
            KIND_COMMIT => WalRecord::Commit {
                xid: Xid(cur.u32()?),
            },
            KIND_ABORT => WalRecord::Abort {
                xid: Xid(cur.u32()?),
            },
            KIND_TRUNCATE => WalRecord::Truncate {
                rel: RelId(cur.u32()?),
                nblocks: cur.u32()?,
            },
            KIND_CLOG_TRUNCATE => WalRecord::ClogTruncate {
                oldest: Xid(cur.u32()?),
            },
            _ => return Err(VacError::Corruption("unknown wal record kind")),
        };
        if cur.pos != src.len() {
            return Err(VacError::Corruption("wal record has trailing bytes"));
        }
        Ok(record)
    }
}

fn put_image(out: &mut Vec<u8>, page: &PageImage) {
    out.extend_from_slice(&page.block.to_be_bytes());
    out.extend_from_slice(&(page.bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&page.bytes);
}

fn put_tid(out: &mut Vec<u8>, tid: &ItemPointer) {
    out.extend_from_slice(&tid.block.to_be_bytes());
    out.extend_from_slice(&tid.slot.to_be_bytes());
}

struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.src.len())
            .ok_or(VacError::Corruption("wal record truncated"))?;
        let bytes = &self.src[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn tid(&mut self) -> Result<ItemPointer> {
        Ok(ItemPointer::new(self.u32()?, self.u16()?))
    }

    fn image(&mut self) -> Result<PageImage> {
        let block = self.u32()?;
        let len = self.u32()? as usize;
        Ok(PageImage {
            block,
            bytes: self.take(len)?.to_vec(),
        })
    }
}

/// Counters describing log activity since open.
#[derive(Clone, Debug, Default)]
pub struct WalStats {
    /// Records appended.
    pub records_appended: u64,
    /// Payload and frame bytes appended.
    pub bytes_appended: u64,
    /// Sync calls issued.
    pub syncs: u64,
}

struct WalState {
    next_lsn: Lsn,
    append_offset: u64,
    synced_offset: u64,
    stats: WalStats,
}

/// Append-only write-ahead log.
pub struct Wal {
    io: Arc<dyn FileIo>,
    state: Mutex<WalState>,
}

fn encode_file_header(start_lsn: Lsn) -> [u8; FILE_HEADER_LEN] {
    let mut buf = [0u8; FILE_HEADER_LEN];
    buf[0..4].copy_from_slice(&WAL_MAGIC);
    buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
    buf[8..16].copy_from_slice(&start_lsn.0.to_be_bytes());
    let crc = crc32_of(&[&buf[0..20]]);
    buf[20..24].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn decode_file_header(buf: &[u8; FILE_HEADER_LEN]) -> Result<Lsn> {
    if buf[0..4] != WAL_MAGIC {
        return Err(VacError::Corruption("wal magic mismatch"));
    }
    if u16::from_be_bytes([buf[4], buf[5]]) != WAL_FORMAT_VERSION {
        return Err(VacError::Corruption("wal format version mismatch"));
    }
    let stored = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
    if crc32_of(&[&buf[0..20]]) != stored {
        return Err(VacError::Corruption("wal header crc mismatch"));
    }
    let mut lsn = [0u8; 8];
    lsn.copy_from_slice(&buf[8..16]);
    Ok(Lsn(u64::from_be_bytes(lsn)))
}

impl Wal {
    /// Opens or creates a log. The append position is placed after the last
    /// intact frame; a torn tail is cut off.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            io.truncate(0)?;
            io.write_at(0, &encode_file_header(Lsn(1)))?;
            io.sync_all()?;
            return Ok(Self {
                io,
                state: Mutex::new(WalState {
                    next_lsn: Lsn(1),
                    append_offset: FILE_HEADER_LEN as u64,
                    synced_offset: FILE_HEADER_LEN as u64,
                    stats: WalStats::default(),
                }),
            });
        }
        let mut header = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut header)?;
        let start_lsn = decode_file_header(&header)?;
        let wal = Self {
            io,
            state: Mutex::new(WalState {
                next_lsn: start_lsn,
                append_offset: FILE_HEADER_LEN as u64,
                synced_offset: FILE_HEADER_LEN as u64,
                stats: WalStats::default(),
            }),
        };
        let (records, end) = wal.scan()?;
        let next_lsn = records
            .last()
            .map(|(lsn, _)| Lsn(lsn.0 + 1))
            .unwrap_or(start_lsn);
        if end < len {
            warn!(valid_end = end, file_len = len, "wal.torn_tail_truncated");
            wal.io.truncate(end)?;
        }
        {
            let mut state = wal.state.lock();
            state.next_lsn = next_lsn;
            state.append_offset = end;
            state.synced_offset = end;
        }
        Ok(wal)
    }

    fn scan(&self) -> Result<(Vec<(Lsn, WalRecord)>, u64)> {
        let len = self.io.len()?;
        let mut offset = FILE_HEADER_LEN as u64;
        let mut records = Vec::new();
        while offset + FRAME_HEADER_LEN as u64 <= len {
            let mut header = [0u8; FRAME_HEADER_LEN];
            self.io.read_at(offset, &mut header)?;
            let stored_header_crc =
                u32::from_be_bytes([header[20], header[21], header[22], header[23]]);
            if crc32_of(&[&header[0..20]]) != stored_header_crc {
                break;
            }
            let mut lsn = [0u8; 8];
            lsn.copy_from_slice(&header[0..8]);
            let lsn = Lsn(u64::from_be_bytes(lsn));
            let kind = header[8];
            let payload_len =
                u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as u64;
            let payload_crc =
                u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
            let payload_start = offset + FRAME_HEADER_LEN as u64;
            if payload_start + payload_len > len {
                break;
            }
            let mut payload = vec![0u8; payload_len as usize];
            self.io.read_at(payload_start, &mut payload)?;
            if crc32_of(&[payload.as_slice()]) != payload_crc {
                break;
            }
            let record = match WalRecord::decode_payload(kind, &payload) {
                Ok(record) => record,
                Err(_) => break,
            };
            records.push((lsn, record));
            offset = payload_start + payload_len;
        }
        Ok((records, offset))
    }

    /// Appends a record whose contents depend on its own LSN (page images
    /// embed the LSN of the change that produced them).
    pub fn append_with<F>(&self, build: F) -> Result<Lsn>
    where
        F: FnOnce(Lsn) -> Result<WalRecord>,
    {
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        let record = build(lsn)?;
        let payload = record.encode_payload();
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| VacError::Invalid("wal record too large"))?;
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..8].copy_from_slice(&lsn.0.to_be_bytes());
        header[8] = record.kind();
        header[12..16].copy_from_slice(&payload_len.to_be_bytes());
        header[16..20].copy_from_slice(&crc32_of(&[payload.as_slice()]).to_be_bytes());
        let header_crc = crc32_of(&[&header[0..20]]);
        header[20..24].copy_from_slice(&header_crc.to_be_bytes());
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&payload);
        self.io.write_at(state.append_offset, &frame)?;
        state.append_offset += frame.len() as u64;
        state.next_lsn = Lsn(lsn.0 + 1);
        state.stats.records_appended += 1;
        state.stats.bytes_appended += frame.len() as u64;
        Ok(lsn)
    }

    /// Appends a record that does not embed its LSN.
    pub fn append(&self, record: WalRecord) -> Result<Lsn> {
        self.append_with(|_| Ok(record))
    }

    /// Makes everything appended so far durable.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.synced_offset == state.append_offset {
            return Ok(());
        }
        self.io.sync_all()?;
        state.synced_offset = state.append_offset;
        state.stats.syncs += 1;
        Ok(())
    }

    /// All intact records in log order.
    pub fn records(&self) -> Result<Vec<(Lsn, WalRecord)>> {
        let _state = self.state.lock();
        Ok(self.scan()?.0)
    }

    /// Empties the log after a checkpoint. LSNs keep increasing.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.io.truncate(0)?;
        self.io.write_at(0, &encode_file_header(state.next_lsn))?;
        self.io.sync_all()?;
        state.append_offset = FILE_HEADER_LEN as u64;
        state.synced_offset = state.append_offset;
        debug!(next_lsn = state.next_lsn.0, "wal.reset");
        Ok(())
    }

    /// LSN the next record will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// Activity counters.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;

    fn image(block: BlockNumber, fill: u8) -> PageImage {
        PageImage {
            block,
            bytes: vec![fill; 64],
        }
    }

    #[test]
    fn append_and_read_back() {
        let io = Arc::new(MemFileIo::new());
        let wal = Wal::open(io.clone()).unwrap();
        let first = wal
            .append(WalRecord::Clean {
                rel: RelId(4),
                unused: vec![1, 3],
                page: image(2, 9),
            })
            .unwrap();
        let second = wal
            .append_with(|lsn| {
                Ok(WalRecord::Move {
                    rel: RelId(4),
                    from: ItemPointer::new(5, 1),
                    to: ItemPointer::new(0, 2),
                    pages: vec![image(5, lsn.0 as u8), image(0, 1)],
                })
            })
            .unwrap();
        wal.append(WalRecord::Commit { xid: Xid(77) }).unwrap();
        wal.flush().unwrap();
        assert!(second > first);

        let reopened = Wal::open(io).unwrap();
        let records = reopened.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], (Lsn(3), WalRecord::Commit { xid: Xid(77) }));
        match &records[1].1 {
            WalRecord::Move { pages, .. } => assert_eq!(pages[0].bytes[0], second.0 as u8),
            other => panic!("unexpected record {other:?}"),
        }
        assert_eq!(reopened.next_lsn(), Lsn(4));
    }

    #[test]
    fn torn_tail_is_ignored_and_cut() {
        let io = Arc::new(MemFileIo::new());
        let wal = Wal::open(io.clone()).unwrap();
        wal.append(WalRecord::Truncate {
            rel: RelId(1),
            nblocks: 3,
        })
        .unwrap();
        wal.append(WalRecord::Abort { xid: Xid(9) }).unwrap();
        let len = io.len().unwrap();
        io.truncate(len - 2).unwrap();
        let reopened = Wal::open(io.clone()).unwrap();
        assert_eq!(reopened.records().unwrap().len(), 1);
        reopened
            .append(WalRecord::ClogTruncate { oldest: Xid(40) })
            .unwrap();
        assert_eq!(Wal::open(io).unwrap().records().unwrap().len(), 2);
    }

    #[test]
    fn reset_keeps_lsn_monotonic() {
        let io = Arc::new(MemFileIo::new());
        let wal = Wal::open(io.clone()).unwrap();
        wal.append(WalRecord::Commit { xid: Xid(3) }).unwrap();
        wal.append(WalRecord::Commit { xid: Xid(4) }).unwrap();
        wal.reset().unwrap();
        assert!(wal.records().unwrap().is_empty());
        let lsn = wal.append(WalRecord::Commit { xid: Xid(5) }).unwrap();
        assert_eq!(lsn, Lsn(3));
        drop(wal);
        assert_eq!(Wal::open(io).unwrap().next_lsn(), Lsn(4));
    }
}
