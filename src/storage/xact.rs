#![forbid(unsafe_code)]

//! Transaction-id assignment, status history and the running set.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{SessionId, Xid};

/// Final or current outcome of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum XactStatus {
    /// Still running (or crashed before recording an outcome).
    InProgress,
    /// Committed.
    Committed,
    /// Aborted or crashed.
    Aborted,
}

/// Persistent part of the transaction manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct XactHistory {
    /// Next id to assign.
    pub next_xid: Xid,
    /// Statuses of ids preceding this one have been discarded.
    pub oldest_retained: Xid,
    /// Recorded statuses keyed by raw id.
    pub statuses: BTreeMap<u32, XactStatus>,
}

impl XactHistory {
    /// Empty history whose first assigned id is `first`.
    pub fn starting_at(first: Xid) -> Self {
        let first = if first.is_normal() {
            first
        } else {
            Xid::FIRST_NORMAL
        };
        Self {
            next_xid: first,
            oldest_retained: first,
            statuses: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Running {
    session: SessionId,
    snapshot_xmin: Xid,
    in_lazy_vacuum: bool,
    outcome_recorded: bool,
}

struct XactState {
    history: XactHistory,
    running: FxHashMap<Xid, Running>,
}

/// Cluster-wide transaction manager.
pub struct TransactionManager {
    state: Mutex<XactState>,
}

impl TransactionManager {
    /// Manager continuing from `history`. Transactions the history still
    /// lists as in progress did not survive the restart and become aborted.
    pub fn new(mut history: XactHistory) -> Self {
        let mut crashed = 0usize;
        for status in history.statuses.values_mut() {
            if *status == XactStatus::InProgress {
                *status = XactStatus::Aborted;
                crashed += 1;
            }
        }
        if crashed > 0 {
            debug!(crashed, "xact.crashed_transactions_aborted");
        }
        Self {
            state: Mutex::new(XactState {
                history,
                running: FxHashMap::default(),
            }),
        }
    }

    fn oldest_running(state: &XactState, ignore_lazy_vacuum: bool) -> Xid {
        let mut result = state.history.next_xid;
        for (xid, running) in &state.running {
            if ignore_lazy_vacuum && running.in_lazy_vacuum {
                continue;
            }
            if xid.precedes(result) {
                result = *xid;
            }
            if running.snapshot_xmin.is_normal() && running.snapshot_xmin.precedes(result) {
                result = running.snapshot_xmin;
            }
        }
        result
    }

    /// Starts a transaction for `session` and returns its id.
    pub fn begin(&self, session: SessionId) -> Xid {
        self.begin_inner(session, false)
    }

    /// Starts a lazy-vacuum transaction; other vacuums ignore it when
    /// computing their oldest-visible watermark.
    pub fn begin_lazy_vacuum(&self, session: SessionId) -> Xid {
        self.begin_inner(session, true)
    }

    fn begin_inner(&self, session: SessionId, in_lazy_vacuum: bool) -> Xid {
        let mut state = self.state.lock();
        let xid = state.history.next_xid;
        state.history.next_xid = xid.next();
        let snapshot_xmin = Self::oldest_running(&state, true);
        let snapshot_xmin = if snapshot_xmin.precedes(xid) {
            snapshot_xmin
        } else {
            xid
        };
        state.history.statuses.insert(xid.0, XactStatus::InProgress);
        state.running.insert(
            xid,
            Running {
                session,
                snapshot_xmin,
                in_lazy_vacuum,
                outcome_recorded: false,
            },
        );
        xid
    }

    /// Records `xid` as committed while it keeps running (holding its locks).
    pub fn record_commit(&self, xid: Xid) {
        let mut state = self.state.lock();
        state.history.statuses.insert(xid.0, XactStatus::Committed);
        if let Some(running) = state.running.get_mut(&xid) {
            running.outcome_recorded = true;
        }
    }

    /// Commits and ends `xid`.
    pub fn commit(&self, xid: Xid) {
        let mut state = self.state.lock();
        state.history.statuses.insert(xid.0, XactStatus::Committed);
        state.running.remove(&xid);
    }

    /// Aborts and ends `xid`. A transaction whose commit was already recorded
    /// stays committed.
    pub fn abort(&self, xid: Xid) {
        let mut state = self.state.lock();
        let committed = matches!(
            state.history.statuses.get(&xid.0),
            Some(XactStatus::Committed)
        );
        if committed {
            warn!(xid = xid.0, "xact.abort_after_commit_ignored");
        } else {
            state.history.statuses.insert(xid.0, XactStatus::Aborted);
        }
        state.running.remove(&xid);
    }

    fn status_locked(state: &XactState, xid: Xid) -> XactStatus {
        if xid == Xid::INVALID {
            return XactStatus::Aborted;
        }
        if !xid.is_normal() {
            return XactStatus::Committed;
        }
        match state.history.statuses.get(&xid.0) {
            Some(XactStatus::InProgress) if !state.running.contains_key(&xid) => {
                XactStatus::Aborted
            }
            Some(status) => *status,
            None if xid.precedes(state.history.oldest_retained) => XactStatus::Committed,
            None => XactStatus::Aborted,
        }
    }

    /// Current status of `xid`.
    pub fn status(&self, xid: Xid) -> XactStatus {
        Self::status_locked(&self.state.lock(), xid)
    }

    /// True while `xid` runs and has not recorded an outcome.
    pub fn is_in_progress(&self, xid: Xid) -> bool {
        let state = self.state.lock();
        state
            .running
            .get(&xid)
            .is_some_and(|running| !running.outcome_recorded)
    }

    /// True if `xid` committed.
    pub fn did_commit(&self, xid: Xid) -> bool {
        self.status(xid) == XactStatus::Committed
    }

    /// Oldest id any running transaction may still consider in progress.
    pub fn oldest_xmin(&self, ignore_lazy_vacuum: bool) -> Xid {
        Self::oldest_running(&self.state.lock(), ignore_lazy_vacuum)
    }

    /// Next id that will be assigned.
    pub fn next_xid(&self) -> Xid {
        self.state.lock().history.next_xid
    }

    /// Oldest id whose status is retained.
    pub fn oldest_retained(&self) -> Xid {
        self.state.lock().history.oldest_retained
    }

    /// Sessions with running transactions.
    pub fn running_sessions(&self) -> Vec<(Xid, SessionId)> {
        self.state
            .lock()
            .running
            .iter()
            .map(|(xid, running)| (*xid, running.session))
            .collect()
    }

    /// Discards statuses of ids preceding `oldest`. The retained horizon
    /// never moves backward.
    pub fn truncate_history(&self, oldest: Xid) -> usize {
        let mut state = self.state.lock();
        if !oldest.follows(state.history.oldest_retained) {
            return 0;
        }
        let before = state.history.statuses.len();
        state
            .history
            .statuses
            .retain(|raw, _| !Xid(*raw).precedes(oldest));
        state.history.oldest_retained = oldest;
        before - state.history.statuses.len()
    }

    /// Applies a logged outcome during recovery.
    pub fn redo_outcome(&self, xid: Xid, committed: bool) {
        let mut state = self.state.lock();
        let status = if committed {
            XactStatus::Committed
        } else {
            XactStatus::Aborted
        };
        state.history.statuses.insert(xid.0, status);
        if xid.follows_or_equals(state.history.next_xid) {
            state.history.next_xid = xid.next();
        }
    }

    /// Moves id assignment past `xid`, an id found on disk after a crash
    /// that may never have reached the status history.
    pub fn advance_past(&self, xid: Xid) {
        if !xid.is_normal() {
            return;
        }
        let mut state = self.state.lock();
        if xid.follows_or_equals(state.history.next_xid) {
            state.history.next_xid = xid.next();
        }
    }

    /// Copy of the persistent state. Running transactions are recorded as
    /// in progress and therefore read back as aborted.
    pub fn snapshot(&self) -> XactHistory {
        self.state.lock().history.clone()
    }
}
