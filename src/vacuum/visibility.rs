#![forbid(unsafe_code)]

//! Vacuum-time visibility classification of row versions.
//!
//! The oracle resolves a header against the transaction manager and caches
//! what it learns in the header's status bits. Callers write the header back
//! and dirty the page whenever [`Classified::hints_changed`] is set.

use serde::Serialize;

use crate::storage::tuple::{InfoMask, TupleHeader};
use crate::storage::xact::TransactionManager;
use crate::types::Xid;

/// Vacuum's view of one row version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HtsvResult {
    /// Visible to someone and not deleted by a committed transaction.
    Live,
    /// Invisible to every running and future transaction; removable.
    Dead,
    /// Deleted by a committed transaction some running transaction cannot see yet.
    RecentlyDead,
    /// Creator still running.
    InsertInProgress,
    /// Deleter still running.
    DeleteInProgress,
}

impl HtsvResult {
    /// True for either in-progress outcome.
    pub fn is_in_progress(self) -> bool {
        matches!(self, HtsvResult::InsertInProgress | HtsvResult::DeleteInProgress)
    }
}

/// Classification plus whether any status bit was set on the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classified {
    /// Outcome.
    pub result: HtsvResult,
    /// Header bits changed and must be written back.
    pub hints_changed: bool,
}

/// Classifies `header` against `oldest_xmin`, setting status bits in place.
pub fn satisfies_vacuum(
    header: &mut TupleHeader,
    oldest_xmin: Xid,
    xact: &TransactionManager,
) -> Classified {
    let before = header.infomask;
    let result = classify(header, oldest_xmin, xact);
    Classified {
        result,
        hints_changed: header.infomask != before,
    }
}

fn classify(header: &mut TupleHeader, oldest_xmin: Xid, xact: &TransactionManager) -> HtsvResult {
    let mask = &mut header.infomask;

    if !mask.contains(InfoMask::XMIN_COMMITTED) {
        if mask.contains(InfoMask::XMIN_INVALID) {
            return HtsvResult::Dead;
        }
        if mask.contains(InfoMask::MOVED_OFF) {
            if xact.is_in_progress(header.xvac) {
                return HtsvResult::DeleteInProgress;
            }
            if xact.did_commit(header.xvac) {
                mask.insert(InfoMask::XMIN_INVALID);
                return HtsvResult::Dead;
            }
            mask.insert(InfoMask::XMIN_COMMITTED);
        } else if mask.contains(InfoMask::MOVED_IN) {
            if xact.is_in_progress(header.xvac) {
                return HtsvResult::InsertInProgress;
            }
            if xact.did_commit(header.xvac) {
                mask.insert(InfoMask::XMIN_COMMITTED);
            } else {
                mask.insert(InfoMask::XMIN_INVALID);
                return HtsvResult::Dead;
            }
        } else if xact.is_in_progress(header.xmin) {
            if mask.contains(InfoMask::XMAX_INVALID) {
                return HtsvResult::InsertInProgress;
            }
            return HtsvResult::DeleteInProgress;
        } else if xact.did_commit(header.xmin) {
            mask.insert(InfoMask::XMIN_COMMITTED);
        } else {
            // aborted or crashed
            mask.insert(InfoMask::XMIN_INVALID);
            return HtsvResult::Dead;
        }
    }

    // creator committed from here on
    if mask.contains(InfoMask::XMAX_INVALID) {
        return HtsvResult::Live;
    }

    if mask.contains(InfoMask::MARKED_FOR_UPDATE) {
        // a row lock never deletes the version
        if !xact.is_in_progress(header.xmax) {
            mask.insert(InfoMask::XMAX_INVALID);
        }
        return HtsvResult::Live;
    }

    if !mask.contains(InfoMask::XMAX_COMMITTED) {
        if xact.is_in_progress(header.xmax) {
            return HtsvResult::DeleteInProgress;
        }
        if xact.did_commit(header.xmax) {
            mask.insert(InfoMask::XMAX_COMMITTED);
        } else {
            mask.insert(InfoMask::XMAX_INVALID);
            return HtsvResult::Live;
        }
    }

    // Inserted and deleted by the same transaction: nobody else ever saw
    // it. An updated version must stay while its parent links to it.
    if header.xmin == header.xmax && !mask.contains(InfoMask::UPDATED) {
        return HtsvResult::Dead;
    }

    if !header.xmax.precedes(oldest_xmin) {
        return HtsvResult::RecentlyDead;
    }
    HtsvResult::Dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::xact::XactHistory;
    use crate::types::{ItemPointer, SessionId};

    const S: SessionId = SessionId(1);

    fn setup() -> TransactionManager {
        TransactionManager::new(XactHistory::starting_at(Xid(10)))
    }

    fn header(xmin: Xid) -> TupleHeader {
        TupleHeader::for_insert(xmin, ItemPointer::new(0, 1))
    }

    fn delete(h: &mut TupleHeader, xmax: Xid) {
        h.xmax = xmax;
        h.infomask.remove(InfoMask::XMAX_INVALID);
    }

    #[test]
    fn committed_insert_is_live_and_hinted() {
        let xm = setup();
        let a = xm.begin(S);
        xm.commit(a);
        let mut h = header(a);
        let c = satisfies_vacuum(&mut h, xm.oldest_xmin(true), &xm);
        assert_eq!(c.result, HtsvResult::Live);
        assert!(c.hints_changed);
        assert!(h.infomask.contains(InfoMask::XMIN_COMMITTED));
        let again = satisfies_vacuum(&mut h, xm.oldest_xmin(true), &xm);
        assert!(!again.hints_changed);
    }

    #[test]
    fn aborted_insert_is_dead() {
        let xm = setup();
        let a = xm.begin(S);
        xm.abort(a);
        let mut h = header(a);
        assert_eq!(satisfies_vacuum(&mut h, xm.next_xid(), &xm).result, HtsvResult::Dead);
        assert!(h.infomask.contains(InfoMask::XMIN_INVALID));
    }

    #[test]
    fn running_creator_and_deleter_are_in_progress() {
        let xm = setup();
        let a = xm.begin(S);
        let mut h = header(a);
        assert_eq!(
            satisfies_vacuum(&mut h, xm.oldest_xmin(true), &xm).result,
            HtsvResult::InsertInProgress
        );
        xm.commit(a);
        let b = xm.begin(S);
        delete(&mut h, b);
        assert_eq!(
            satisfies_vacuum(&mut h, xm.oldest_xmin(true), &xm).result,
            HtsvResult::DeleteInProgress
        );
    }

    #[test]
    fn deleted_version_dead_only_behind_watermark() {
        let xm = setup();
        let a = xm.begin(S);
        xm.commit(a);
        let reader = xm.begin(S);
        let b = xm.begin(S);
        xm.commit(b);
        let mut h = header(a);
        delete(&mut h, b);
        let held = xm.oldest_xmin(true);
        assert_eq!(held, reader);
        assert_eq!(satisfies_vacuum(&mut h, held, &xm).result, HtsvResult::RecentlyDead);
        xm.commit(reader);
        assert_eq!(
            satisfies_vacuum(&mut h, xm.oldest_xmin(true), &xm).result,
            HtsvResult::Dead
        );
    }

    #[test]
    fn aborted_deleter_leaves_version_live() {
        let xm = setup();
        let a = xm.begin(S);
        xm.commit(a);
        let b = xm.begin(S);
        xm.abort(b);
        let mut h = header(a);
        delete(&mut h, b);
        assert_eq!(satisfies_vacuum(&mut h, xm.next_xid(), &xm).result, HtsvResult::Live);
        assert!(h.infomask.contains(InfoMask::XMAX_INVALID));
    }

    #[test]
    fn row_lock_never_kills() {
        let xm = setup();
        let a = xm.begin(S);
        xm.commit(a);
        let locker = xm.begin(S);
        let mut h = header(a);
        delete(&mut h, locker);
        h.infomask.insert(InfoMask::MARKED_FOR_UPDATE);
        assert_eq!(satisfies_vacuum(&mut h, xm.next_xid(), &xm).result, HtsvResult::Live);
        assert!(!h.infomask.contains(InfoMask::XMAX_INVALID));
        xm.commit(locker);
        assert_eq!(satisfies_vacuum(&mut h, xm.next_xid(), &xm).result, HtsvResult::Live);
        assert!(h.infomask.contains(InfoMask::XMAX_INVALID));
    }

    #[test]
    fn self_deleted_insert_is_dead_unless_updated() {
        let xm = setup();
        let a = xm.begin(S);
        let reader = xm.begin(S);
        xm.commit(a);
        let mut plain = header(a);
        delete(&mut plain, a);
        let mut updated = plain;
        updated.infomask.insert(InfoMask::UPDATED);
        let oldest = xm.oldest_xmin(true);
        assert_eq!(oldest, a);
        assert_eq!(satisfies_vacuum(&mut plain, oldest, &xm).result, HtsvResult::Dead);
        assert_eq!(
            satisfies_vacuum(&mut updated, oldest, &xm).result,
            HtsvResult::RecentlyDead
        );
        xm.commit(reader);
    }

    #[test]
    fn moved_versions_follow_the_mover() {
        let xm = setup();
        let a = xm.begin(S);
        xm.commit(a);
        let mover = xm.begin(S);
        let mut off = header(a);
        off.infomask.insert(InfoMask::MOVED_OFF);
        off.xvac = mover;
        let mut on = header(a);
        on.infomask.insert(InfoMask::MOVED_IN);
        on.xvac = mover;
        let (mut off_probe, mut on_probe) = (off, on);
        assert_eq!(
            satisfies_vacuum(&mut off_probe, xm.next_xid(), &xm).result,
            HtsvResult::DeleteInProgress
        );
        assert_eq!(
            satisfies_vacuum(&mut on_probe, xm.next_xid(), &xm).result,
            HtsvResult::InsertInProgress
        );
        assert!(!off_probe.infomask.contains(InfoMask::XMIN_COMMITTED));

        xm.abort(mover);
        let (mut off_aborted, mut on_aborted) = (off, on);
        assert_eq!(
            satisfies_vacuum(&mut off_aborted, xm.next_xid(), &xm).result,
            HtsvResult::Live
        );
        assert_eq!(
            satisfies_vacuum(&mut on_aborted, xm.next_xid(), &xm).result,
            HtsvResult::Dead
        );
    }

    #[test]
    fn committed_move_swaps_which_copy_survives() {
        let xm = setup();
        let a = xm.begin(S);
        xm.commit(a);
        let mover = xm.begin(S);
        xm.record_commit(mover);
        let mut off = header(a);
        off.infomask.insert(InfoMask::MOVED_OFF);
        off.xvac = mover;
        let mut on = header(a);
        on.infomask.insert(InfoMask::MOVED_IN);
        on.xvac = mover;
        assert_eq!(satisfies_vacuum(&mut off, xm.next_xid(), &xm).result, HtsvResult::Dead);
        assert_eq!(satisfies_vacuum(&mut on, xm.next_xid(), &xm).result, HtsvResult::Live);
        assert!(on.infomask.contains(InfoMask::XMIN_COMMITTED));
    }
}
