use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::storage::database::{Cluster, Database, CLUSTER_FILE};

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens the cluster rooted at `path`, replaying any log left by a crash.
///
/// # Errors
///
/// Returns an error if the cluster doesn't exist and `create_if_missing` is
/// false, or if opening or recovery fails.
pub fn open_cluster(path: &Path, opts: &AdminOpenOptions) -> Result<Cluster> {
    if !path.join(CLUSTER_FILE).exists() {
        if !opts.create_if_missing {
            return Err(AdminError::missing_cluster(path));
        }
        ensure_dir(path)?;
    }
    let cluster_opts = opts
        .cluster
        .clone()
        .create_if_missing(opts.create_if_missing);
    Ok(Cluster::open(path, cluster_opts)?)
}

/// Looks up the database named in `opts`, creating it when allowed.
///
/// # Errors
///
/// Returns [`AdminError::MissingDatabase`] if it doesn't exist and
/// `create_if_missing` is false.
pub fn open_database(cluster: &Cluster, opts: &AdminOpenOptions) -> Result<Arc<Database>> {
    if let Some(db) = cluster.database(&opts.database) {
        return Ok(db);
    }
    if !opts.create_if_missing {
        return Err(AdminError::MissingDatabase(opts.database.clone()));
    }
    Ok(cluster.create_database(&opts.database, opts.role)?)
}

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}
