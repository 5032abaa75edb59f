use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{open_cluster, open_database};
use crate::admin::Result;
use crate::storage::database::CheckpointStats;
use crate::vacuum::{self, VacuumConfig, VacuumOptions, VacuumReport};

/// Report generated after a vacuum command completes.
#[derive(Debug, Clone, Serialize)]
pub struct VacuumRunReport {
    /// Engine report.
    #[serde(flatten)]
    pub vacuum: VacuumReport,
    /// Checkpoint taken after the run.
    pub checkpoint: CheckpointStats,
    /// Total duration including open and checkpoint, in milliseconds.
    pub duration_ms: f64,
}

/// Vacuums one database of the cluster at `path`, then checkpoints so the
/// shrunken files and new watermarks are durable without the log.
///
/// Relations the caller may not vacuum are skipped with a warning in the
/// report rather than failing the command.
///
/// # Errors
///
/// Returns an error if the cluster or database cannot be opened, the run is
/// cancelled, or a storage error escapes a relation's unit of work.
pub fn vacuum_database(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    vacuum_opts: &VacuumOptions,
    config: &VacuumConfig,
) -> Result<VacuumRunReport> {
    let start = Instant::now();
    let cluster = open_cluster(path.as_ref(), opts)?;
    let db = open_database(&cluster, opts)?;
    let session = cluster.session(opts.role, opts.superuser);
    let report = vacuum::vacuum(&cluster, &db, &session, vacuum_opts, config)?;
    let checkpoint = cluster.checkpoint()?;
    let duration_ms = start.elapsed().as_secs_f64() * 1_000.0;
    info!(
        database = %report.database,
        relations = report.relations.len(),
        warnings = report.warnings.len(),
        duration_ms,
        "admin.vacuum"
    );
    Ok(VacuumRunReport {
        vacuum: report,
        checkpoint,
        duration_ms,
    })
}
