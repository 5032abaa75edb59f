use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{open_cluster, open_database};
use crate::admin::Result;

/// Report generated after initializing a cluster.
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    /// Cluster root directory.
    pub root: String,
    /// Database created (or found) in the cluster.
    pub database: String,
    /// Page size of every relation file.
    pub page_size: usize,
    /// First transaction id the cluster will hand out.
    pub next_xid: u32,
}

/// Creates a cluster at `path` holding the database named in `opts`.
///
/// Running it against an existing cluster only adds the database when it is
/// missing.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the cluster files
/// cannot be written.
pub fn init(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<InitReport> {
    let path = path.as_ref();
    let mut opts = opts.clone();
    opts.create_if_missing = true;
    let cluster = open_cluster(path, &opts)?;
    let db = open_database(&cluster, &opts)?;
    cluster.checkpoint()?;
    info!(root = %path.display(), database = %db.name(), "admin.init");
    Ok(InitReport {
        root: path.display().to_string(),
        database: db.name(),
        page_size: cluster.options().page_size,
        next_xid: cluster.xact().next_xid().0,
    })
}
