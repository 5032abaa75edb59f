#![forbid(unsafe_code)]

//! Cluster administration and maintenance utilities.
//!
//! Each entry point opens the cluster directory itself, replaying any log a
//! crash left behind, and returns a serializable report for the CLI.

mod checkpoint;
mod error;
mod init;
mod options;
mod seed;
mod stats;
mod util;
mod vacuum;

/// Writes every dirty page back and empties the write-ahead log.
pub use checkpoint::{checkpoint, CheckpointReport};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Creates a cluster directory and its first database.
pub use init::{init, InitReport};

/// Configuration options for opening a cluster in admin mode.
pub use options::{AdminOpenOptions, DEFAULT_DATABASE};

/// Demo data with dead row versions for vacuum to reclaim.
pub use seed::{seed_demo, SeedOptions, SeedReport};

/// Catalog, watermark and file statistics.
pub use stats::{
    stats, ClusterSection, DatabaseSection, RelationSection, StatsReport, WalStatsSection,
};

/// Utility functions for opening clusters and databases.
pub use util::{open_cluster, open_database};

/// Vacuum of one database followed by a checkpoint.
pub use vacuum::{vacuum_database, VacuumRunReport};
