#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Options of one vacuum command.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VacuumOptions {
    /// Exclusive-lock compaction that relocates rows and shrinks the file.
    pub full: bool,
    /// Freeze every live row older than the oldest running transaction.
    pub freeze: bool,
    /// Report per-relation detail at info level instead of debug.
    pub verbose: bool,
    /// Run the analyzer on each relation after vacuuming it.
    pub analyze: bool,
    /// Single relation to process; every ordinary relation when `None`.
    pub relation: Option<String>,
}

impl VacuumOptions {
    /// Database-wide lazy vacuum.
    pub fn lazy() -> Self {
        Self::default()
    }

    /// Database-wide full vacuum.
    pub fn full() -> Self {
        Self {
            full: true,
            ..Self::default()
        }
    }

    /// Restricts the run to `relation`.
    pub fn relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    /// Sets the freeze flag.
    pub fn freeze(mut self, freeze: bool) -> Self {
        self.freeze = freeze;
        self
    }

    /// Sets the verbose flag.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Sets the analyze flag.
    pub fn analyze(mut self, analyze: bool) -> Self {
        self.analyze = analyze;
        self
    }
}

/// Tunables shared by every vacuum run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VacuumConfig {
    /// Memory budget for dead-row locations collected by lazy vacuum, in KiB.
    pub vacuum_mem_kb: usize,
    /// Capacity of the free-space directory, in pages.
    pub max_fsm_pages: usize,
    /// Distance behind the current transaction id below which live rows are
    /// frozen when `freeze` is not requested.
    pub freeze_min_age: u32,
    /// Lazy vacuum truncates when at least this many tail pages are free...
    pub rel_truncate_minimum: u32,
    /// ...or at least `rel_pages / rel_truncate_fraction` are.
    pub rel_truncate_fraction: u32,
    /// Age of the oldest frozen id that triggers a wraparound warning.
    pub wraparound_warn_age: u32,
    /// Base nap once the cost balance reaches the limit, in milliseconds.
    /// Zero turns cost-based delay off.
    pub vacuum_cost_delay_ms: u64,
    /// Balance that triggers a nap.
    pub vacuum_cost_limit: u64,
    /// Cost of a page found in the cache.
    pub vacuum_cost_page_hit: u64,
    /// Cost of a page read from the file.
    pub vacuum_cost_page_miss: u64,
    /// Cost of dirtying a clean page.
    pub vacuum_cost_page_dirty: u64,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            vacuum_mem_kb: 8 * 1024,
            max_fsm_pages: 20_000,
            freeze_min_age: u32::MAX >> 2,
            rel_truncate_minimum: 1000,
            rel_truncate_fraction: 16,
            wraparound_warn_age: (u32::MAX >> 3) * 3,
            vacuum_cost_delay_ms: 0,
            vacuum_cost_limit: 200,
            vacuum_cost_page_hit: 1,
            vacuum_cost_page_miss: 10,
            vacuum_cost_page_dirty: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: VacuumConfig = serde_json::from_str(r#"{"vacuum_mem_kb": 64}"#).unwrap();
        assert_eq!(cfg.vacuum_mem_kb, 64);
        assert_eq!(cfg.freeze_min_age, u32::MAX >> 2);
        assert_eq!(cfg.rel_truncate_fraction, 16);
        assert_eq!(cfg.vacuum_cost_delay_ms, 0);
        assert_eq!(cfg.vacuum_cost_limit, 200);
    }

    #[test]
    fn builders_compose() {
        let opts = VacuumOptions::full().relation("orders").freeze(true);
        assert!(opts.full && opts.freeze && !opts.analyze);
        assert_eq!(opts.relation.as_deref(), Some("orders"));
    }
}
