#![forbid(unsafe_code)]

//! Update-chain resolution for full compaction.
//!
//! A version that is part of a chain cannot move on its own: readers follow
//! `ctid` from the oldest version they can see to the one they should use.
//! The resolver walks forward to the chain tail, then back to the head
//! through the links recorded by the scanner, reserving destination space
//! for every member. Any surprise on the way abandons the chain and hands
//! back the reservations.

use smallvec::SmallVec;

use crate::storage::relation::RelationFile;
use crate::storage::tuple::{InfoMask, TupleHeader};
use crate::types::{ItemPointer, Result, VacError, Xid};
use crate::vacuum::pagelist::{VacPageList, VtLinks};

/// One chain member with its reserved destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChainMember {
    pub(crate) tid: ItemPointer,
    /// Index of the destination descriptor in the page arena.
    pub(crate) dest: usize,
    /// First reservation on the destination: it is reaped before the copy.
    pub(crate) clean_dest: bool,
    reserved: usize,
}

/// Chains are usually a handful of versions long.
pub(crate) type ChainMembers = SmallVec<[ChainMember; 4]>;

/// Outcome of planning a chain move.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChainPlan {
    /// Members from tail to head, each with a reservation.
    Move(ChainMembers),
    /// Nothing reserved; the reason is reported to the user.
    Abandoned(&'static str),
}

/// True if the version at `tid` belongs to an update chain that must move
/// as a whole.
pub(crate) fn needs_chain_move(header: &TupleHeader, tid: ItemPointer, oldest_xmin: Xid) -> bool {
    (header.infomask.contains(InfoMask::UPDATED) && !header.xmin.precedes(oldest_xmin))
        || (header.has_deleter() && !header.is_chain_tail_at(tid))
}

fn read_version(file: &RelationFile, tid: ItemPointer) -> Result<Option<(TupleHeader, usize)>> {
    if tid.block >= file.nblocks() {
        return Ok(None);
    }
    let frame = file.buffer(tid.block)?;
    let page = frame.read();
    match page.item(tid.slot) {
        Some(bytes) => Ok(Some((TupleHeader::decode(bytes)?, bytes.len()))),
        None => Ok(None),
    }
}

/// Set on a version this vacuum already relocated.
fn moved_by(header: &TupleHeader, me: Xid) -> bool {
    header.infomask.contains(InfoMask::MOVED_OFF) && header.xvac == me
}

fn release(pages: &mut VacPageList, members: &[ChainMember]) {
    for member in members.iter().rev() {
        pages.pages[member.dest].release(member.reserved);
    }
}

/// Plans the move of the chain containing `start`. Destinations come from
/// `targets`, indices into the arena of `pages` in block order.
#[allow(clippy::too_many_arguments)]
pub(crate) fn plan_chain(
    file: &RelationFile,
    start: ItemPointer,
    start_header: TupleHeader,
    start_len: usize,
    oldest_xmin: Xid,
    me: Xid,
    vtlinks: &VtLinks,
    pages: &mut VacPageList,
    targets: &[usize],
) -> Result<ChainPlan> {
    if vtlinks.is_empty() {
        return Ok(ChainPlan::Abandoned("parent item in update-chain not found"));
    }

    let mut tid = start;
    let mut header = start_header;
    let mut len = start_len;
    if moved_by(&header, me) {
        return Ok(ChainPlan::Abandoned("update-chain member was already moved"));
    }
    while header.has_deleter() && !header.is_chain_tail_at(tid) {
        let next = header.ctid;
        let Some((next_header, next_len)) = read_version(file, next)? else {
            return Ok(ChainPlan::Abandoned(
                "child itemid in update-chain marked as unused",
            ));
        };
        if next_header.xmin != header.xmax {
            return Ok(ChainPlan::Abandoned(
                "child item in update-chain was not created by its parent's updater",
            ));
        }
        if moved_by(&next_header, me) {
            return Ok(ChainPlan::Abandoned("update-chain member was already moved"));
        }
        tid = next;
        header = next_header;
        len = next_len;
    }

    let mut members = ChainMembers::new();
    let mut to: Option<usize> = None;
    loop {
        let dest = match to.filter(|idx| pages.pages[*idx].enough_space(len)) {
            Some(idx) => idx,
            None => match targets
                .iter()
                .copied()
                .find(|idx| pages.pages[*idx].enough_space(len))
            {
                Some(idx) => idx,
                None => {
                    release(pages, &members);
                    return Ok(ChainPlan::Abandoned("no room for update-chain member"));
                }
            },
        };
        to = Some(dest);
        let reserved = pages.pages[dest].reserve(len);
        members.push(ChainMember {
            tid,
            dest,
            clean_dest: pages.pages[dest].offsets_used == 1,
            reserved,
        });

        if !header.infomask.contains(InfoMask::UPDATED) || header.xmin.precedes(oldest_xmin) {
            break;
        }
        let Some(parent) = vtlinks.parent_of(tid) else {
            release(pages, &members);
            return Ok(ChainPlan::Abandoned("parent item in update-chain not found"));
        };
        let Some((parent_header, parent_len)) = read_version(file, parent)? else {
            return Err(VacError::Integrity(format!(
                "parent itemid {parent} marked as unused"
            )));
        };
        if parent_header.xmax != header.xmin {
            release(pages, &members);
            return Ok(ChainPlan::Abandoned("too old parent tuple found"));
        }
        if moved_by(&parent_header, me) {
            release(pages, &members);
            return Ok(ChainPlan::Abandoned("update-chain member was already moved"));
        }
        tid = parent;
        header = parent_header;
        len = parent_len;
    }
    Ok(ChainPlan::Move(members))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use crate::storage::tuple::encode_tuple;
    use crate::types::{RelId, SlotNo};
    use crate::vacuum::pagelist::VacPage;
    use std::sync::Arc;

    const ME: Xid = Xid(99);

    fn version(xmin: u32, xmax: Option<u32>, ctid: ItemPointer, updated: bool) -> TupleHeader {
        let mut header = TupleHeader::for_insert(Xid(xmin), ctid);
        header.infomask.insert(InfoMask::XMIN_COMMITTED);
        if let Some(xmax) = xmax {
            header.xmax = Xid(xmax);
            header.infomask.remove(InfoMask::XMAX_INVALID);
            header.infomask.insert(InfoMask::XMAX_COMMITTED);
        }
        if updated {
            header.infomask.insert(InfoMask::UPDATED);
        }
        header
    }

    fn put(file: &RelationFile, block: u32, header: TupleHeader) -> SlotNo {
        let frame = file.buffer(block).unwrap();
        let mut page = frame.write();
        page.add_item(&encode_tuple(&header, b"payload").unwrap()).unwrap()
    }

    /// Block 0 is the destination, block 1 holds a three-version chain
    /// 1 -> 2 -> 3 created by transactions 10, 20 and 30.
    fn chain_fixture() -> (RelationFile, VtLinks) {
        let file = RelationFile::open(RelId(5), Arc::new(MemFileIo::new()), 1024).unwrap();
        file.extend().unwrap();
        file.extend().unwrap();
        let t1 = ItemPointer::new(1, 1);
        let t2 = ItemPointer::new(1, 2);
        let t3 = ItemPointer::new(1, 3);
        put(&file, 1, version(10, Some(20), t2, false));
        put(&file, 1, version(20, Some(30), t3, true));
        put(&file, 1, version(30, None, t3, true));
        let mut links = VtLinks::default();
        links.push(t2, t1);
        links.push(t3, t2);
        links.sort();
        (file, links)
    }

    fn target_list(free: usize) -> VacPageList {
        let mut pages = VacPageList::default();
        let mut page = VacPage::new(0);
        page.free = free;
        pages.insert(page, false, true);
        pages
    }

    #[test]
    fn chain_detection() {
        let tid = ItemPointer::new(0, 1);
        let plain = version(10, None, tid, false);
        assert!(!needs_chain_move(&plain, tid, Xid(100)));
        let young_update = version(50, None, tid, true);
        assert!(needs_chain_move(&young_update, tid, Xid(40)));
        assert!(!needs_chain_move(&young_update, tid, Xid(60)));
        let superseded = version(10, Some(20), ItemPointer::new(0, 2), false);
        assert!(needs_chain_move(&superseded, tid, Xid(100)));
    }

    #[test]
    fn whole_chain_is_planned_tail_first() {
        let (file, links) = chain_fixture();
        let mut pages = target_list(900);
        let head = ItemPointer::new(1, 1);
        let (header, len) = read_version(&file, head).unwrap().unwrap();
        let plan = plan_chain(&file, head, header, len, Xid(15), ME, &links, &mut pages, &[0]).unwrap();
        let ChainPlan::Move(members) = plan else {
            panic!("expected a move plan");
        };
        let tids: Vec<_> = members.iter().map(|m| m.tid.slot).collect();
        assert_eq!(tids, vec![3, 2, 1]);
        assert!(members[0].clean_dest);
        assert!(!members[1].clean_dest);
        assert_eq!(pages.pages[0].offsets_used, 3);
    }

    #[test]
    fn missing_room_releases_every_reservation() {
        let (file, links) = chain_fixture();
        let (_, len) = read_version(&file, ItemPointer::new(1, 1)).unwrap().unwrap();
        let room = 2 * (crate::types::max_align(len) + crate::storage::page::ITEM_ID_LEN);
        let mut pages = target_list(room);
        let head = ItemPointer::new(1, 1);
        let (header, len) = read_version(&file, head).unwrap().unwrap();
        let plan = plan_chain(&file, head, header, len, Xid(15), ME, &links, &mut pages, &[0]).unwrap();
        assert!(matches!(plan, ChainPlan::Abandoned(_)));
        assert_eq!(pages.pages[0].free, room);
        assert_eq!(pages.pages[0].offsets_used, 0);
    }

    #[test]
    fn mismatched_parent_abandons() {
        let (file, _) = chain_fixture();
        let mut links = VtLinks::default();
        // Claim slot 3 was produced by slot 1, whose deleter is 20, not 30.
        links.push(ItemPointer::new(1, 3), ItemPointer::new(1, 1));
        links.sort();
        let mut pages = target_list(900);
        let tail = ItemPointer::new(1, 3);
        let (header, len) = read_version(&file, tail).unwrap().unwrap();
        let plan = plan_chain(&file, tail, header, len, Xid(15), ME, &links, &mut pages, &[0]).unwrap();
        assert_eq!(plan, ChainPlan::Abandoned("too old parent tuple found"));
        assert_eq!(pages.pages[0].offsets_used, 0);
    }

    #[test]
    fn relocated_member_is_never_planned_twice() {
        let (file, links) = chain_fixture();
        {
            let frame = file.buffer(1).unwrap();
            let mut page = frame.write();
            let mut tail = page.header(3).unwrap();
            tail.infomask.insert(InfoMask::MOVED_OFF);
            tail.infomask.remove(InfoMask::XMIN_COMMITTED);
            tail.xvac = ME;
            page.set_header(3, &tail).unwrap();
        }
        let mut pages = target_list(900);
        let head = ItemPointer::new(1, 1);
        let (header, len) = read_version(&file, head).unwrap().unwrap();
        let plan = plan_chain(&file, head, header, len, Xid(15), ME, &links, &mut pages, &[0]).unwrap();
        assert_eq!(plan, ChainPlan::Abandoned("update-chain member was already moved"));
        assert_eq!(pages.pages[0].offsets_used, 0);
        assert_eq!(pages.pages[0].free, 900);
    }
}
