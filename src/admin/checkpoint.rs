use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_cluster;
use crate::admin::Result;

/// Report generated after executing a checkpoint operation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    /// Duration of the checkpoint operation in milliseconds.
    pub duration_ms: f64,
    /// Dirty pages written back to relation files.
    pub pages_written: usize,
    /// Databases whose catalogs were persisted.
    pub databases: usize,
    /// Log records replayed while opening the cluster.
    pub records_replayed: usize,
}

/// Executes a checkpoint on the cluster at `path`.
///
/// Opening the cluster replays any log left behind by a crash; the checkpoint
/// then writes every page back and empties the log.
///
/// # Errors
///
/// Returns an error if the cluster cannot be opened or the checkpoint fails.
pub fn checkpoint(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<CheckpointReport> {
    let cluster = open_cluster(path.as_ref(), opts)?;
    let recovery = cluster.recovery_stats();
    let start = Instant::now();
    let stats = cluster.checkpoint()?;
    let elapsed = start.elapsed();
    Ok(CheckpointReport {
        duration_ms: elapsed.as_secs_f64() * 1_000.0,
        pages_written: stats.pages_written,
        databases: stats.databases,
        records_replayed: recovery.records,
    })
}
