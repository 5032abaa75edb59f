use crate::storage::options::ClusterOptions;
use crate::types::RoleId;

/// Name of the database opened when none is given.
pub const DEFAULT_DATABASE: &str = "postgres";

/// Common options used when opening a cluster for administrative commands.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Cluster configuration.
    pub cluster: ClusterOptions,
    /// Database the command connects to.
    pub database: String,
    /// Role the command runs as.
    pub role: RoleId,
    /// Whether that role bypasses ownership checks.
    pub superuser: bool,
    /// Whether to create the cluster and database if they don't exist.
    pub create_if_missing: bool,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            cluster: ClusterOptions::default(),
            database: DEFAULT_DATABASE.to_string(),
            role: RoleId(10),
            superuser: true,
            create_if_missing: false,
        }
    }
}
