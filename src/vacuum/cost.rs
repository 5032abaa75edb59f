#![forbid(unsafe_code)]

//! Cost-based vacuum delay.
//!
//! Page accesses add to a balance: a cache hit, a read from the file and
//! the first dirtying of a page each carry a configured weight. At every
//! delay point a balance at or past the limit puts the vacuum to sleep for
//! the base delay scaled by `balance / limit`, capped at four times the base
//! delay, and the balance starts over.

use std::time::Duration;

use parking_lot::Mutex;

use crate::storage::relation::UsageSnapshot;
use crate::vacuum::options::VacuumConfig;

#[derive(Debug)]
struct CostState {
    seen: UsageSnapshot,
    balance: u64,
}

/// Accumulated page-access cost of one relation pass.
#[derive(Debug)]
pub(crate) struct CostBalance {
    delay: Duration,
    limit: u64,
    page_hit: u64,
    page_miss: u64,
    page_dirty: u64,
    state: Mutex<CostState>,
}

impl CostBalance {
    /// Starts counting from `start`; accesses before it are free.
    pub(crate) fn new(config: &VacuumConfig, start: UsageSnapshot) -> Self {
        Self {
            delay: Duration::from_millis(config.vacuum_cost_delay_ms),
            limit: config.vacuum_cost_limit,
            page_hit: config.vacuum_cost_page_hit,
            page_miss: config.vacuum_cost_page_miss,
            page_dirty: config.vacuum_cost_page_dirty,
            state: Mutex::new(CostState {
                seen: start,
                balance: 0,
            }),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.delay.is_zero() && self.limit > 0
    }

    pub(crate) fn balance(&self) -> u64 {
        self.state.lock().balance
    }

    /// Charges the accesses between the last call and `now`. Returns the nap
    /// due, if any, and resets the balance when one is.
    pub(crate) fn accrue(&self, now: UsageSnapshot) -> Option<Duration> {
        if !self.is_active() {
            return None;
        }
        let mut state = self.state.lock();
        let cost = now
            .hits
            .saturating_sub(state.seen.hits)
            .saturating_mul(self.page_hit)
            .saturating_add(
                now.misses
                    .saturating_sub(state.seen.misses)
                    .saturating_mul(self.page_miss),
            )
            .saturating_add(
                now.dirtied
                    .saturating_sub(state.seen.dirtied)
                    .saturating_mul(self.page_dirty),
            );
        state.seen = now;
        state.balance = state.balance.saturating_add(cost);
        if state.balance < self.limit {
            return None;
        }
        let nanos = self.delay.as_nanos() * u128::from(state.balance) / u128::from(self.limit);
        state.balance = 0;
        let nap = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        Some(nap.min(self.delay * 4))
    }
}
