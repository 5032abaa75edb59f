#![forbid(unsafe_code)]

//! Relation-level lock manager and cooperative cancellation.
//!
//! Holds belong to a session and are scoped either to one transaction
//! (released when it ends) or to the session itself (released explicitly,
//! used to keep a relation alive across several transactions). Holds of the
//! same session never conflict with each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

use crate::types::{RelId, Result, SessionId, VacError, Xid};

/// Relation lock strength, weakest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum LockMode {
    /// Plain readers.
    AccessShare,
    /// Inserting, updating and deleting writers.
    RowExclusive,
    /// Lazy vacuum and similar maintenance: excludes itself and DDL.
    ShareUpdateExclusive,
    /// Excludes everything, including readers.
    AccessExclusive,
}

impl LockMode {
    /// Returns true if the two modes cannot be held by different sessions at once.
    pub fn conflicts_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (AccessExclusive, _) | (_, AccessExclusive) => true,
            (ShareUpdateExclusive, ShareUpdateExclusive) => true,
            _ => false,
        }
    }
}

/// Lifetime of a lock hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// Released when the transaction commits or aborts.
    Transaction(Xid),
    /// Released explicitly by the session.
    Session,
}

#[derive(Clone, Debug)]
struct Hold {
    session: SessionId,
    scope: LockScope,
    mode: LockMode,
    count: u32,
}

/// Lock table shared by every session of a cluster.
pub struct LockManager {
    table: Mutex<FxHashMap<RelId, Vec<Hold>>>,
    released: Condvar,
    wait_timeout: Duration,
}

impl LockManager {
    /// Creates a lock table whose blocking acquisitions give up after `wait_timeout`.
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(FxHashMap::default()),
            released: Condvar::new(),
            wait_timeout,
        }
    }

    fn grantable(holds: &[Hold], session: SessionId, mode: LockMode) -> bool {
        holds
            .iter()
            .all(|hold| hold.session == session || !hold.mode.conflicts_with(mode))
    }

    fn grant(holds: &mut Vec<Hold>, session: SessionId, scope: LockScope, mode: LockMode) {
        match holds
            .iter_mut()
            .find(|hold| hold.session == session && hold.scope == scope && hold.mode == mode)
        {
            Some(hold) => hold.count += 1,
            None => holds.push(Hold {
                session,
                scope,
                mode,
                count: 1,
            }),
        }
    }

    /// Acquires `mode` on `rel`, waiting up to the configured timeout.
    pub fn acquire(
        &self,
        rel: RelId,
        mode: LockMode,
        session: SessionId,
        scope: LockScope,
    ) -> Result<()> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut table = self.table.lock();
        loop {
            let holds = table.entry(rel).or_default();
            if Self::grantable(holds, session, mode) {
                Self::grant(holds, session, scope, mode);
                return Ok(());
            }
            if self.released.wait_until(&mut table, deadline).timed_out() {
                let holds = table.entry(rel).or_default();
                if Self::grantable(holds, session, mode) {
                    Self::grant(holds, session, scope, mode);
                    return Ok(());
                }
                debug!(rel = rel.0, ?mode, "lock.timeout");
                return Err(VacError::LockTimeout { rel });
            }
        }
    }

    /// Acquires `mode` only if it can be granted immediately.
    pub fn try_acquire(
        &self,
        rel: RelId,
        mode: LockMode,
        session: SessionId,
        scope: LockScope,
    ) -> bool {
        let mut table = self.table.lock();
        let holds = table.entry(rel).or_default();
        if Self::grantable(holds, session, mode) {
            Self::grant(holds, session, scope, mode);
            true
        } else {
            false
        }
    }

    /// Releases one hold previously granted with the same arguments.
    pub fn release(&self, rel: RelId, mode: LockMode, session: SessionId, scope: LockScope) {
        let mut table = self.table.lock();
        if let Some(holds) = table.get_mut(&rel) {
            if let Some(idx) = holds
                .iter()
                .position(|h| h.session == session && h.scope == scope && h.mode == mode)
            {
                holds[idx].count -= 1;
                if holds[idx].count == 0 {
                    holds.swap_remove(idx);
                }
            }
            if holds.is_empty() {
                table.remove(&rel);
            }
        }
        drop(table);
        self.released.notify_all();
    }

    /// Releases every hold scoped to `xid`.
    pub fn release_transaction(&self, xid: Xid) {
        let mut table = self.table.lock();
        for holds in table.values_mut() {
            holds.retain(|hold| hold.scope != LockScope::Transaction(xid));
        }
        table.retain(|_, holds| !holds.is_empty());
        drop(table);
        self.released.notify_all();
    }

    /// Modes currently held on `rel`, by session.
    pub fn holders(&self, rel: RelId) -> Vec<(SessionId, LockMode)> {
        self.table
            .lock()
            .get(&rel)
            .map(|holds| holds.iter().map(|h| (h.session, h.mode)).collect())
            .unwrap_or_default()
    }
}

/// Session-scoped hold released on drop.
pub struct SessionLockGuard {
    locks: Arc<LockManager>,
    rel: RelId,
    mode: LockMode,
    session: SessionId,
}

impl SessionLockGuard {
    /// Acquires a session-scoped hold, waiting like [`LockManager::acquire`].
    pub fn acquire(
        locks: Arc<LockManager>,
        rel: RelId,
        mode: LockMode,
        session: SessionId,
    ) -> Result<Self> {
        locks.acquire(rel, mode, session, LockScope::Session)?;
        Ok(Self {
            locks,
            rel,
            mode,
            session,
        })
    }

    /// Relation held.
    pub fn rel(&self) -> RelId {
        self.rel
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        self.locks
            .release(self.rel, self.mode, self.session, LockScope::Session);
    }
}

/// Cooperative cancellation flag polled at page and relation granularity.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, not-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns [`VacError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(VacError::Cancelled)
        } else {
            Ok(())
        }
    }
}
