use std::path::{Path, PathBuf};

use crate::types::VacError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No cluster directory at the specified path.
    #[error("cluster not found: {0}")]
    MissingCluster(PathBuf),
    /// The cluster has no database by that name.
    #[error("database not found: {0}")]
    MissingDatabase(String),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Storage or vacuum error.
    #[error(transparent)]
    Core(#[from] VacError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_cluster(path: impl AsRef<Path>) -> Self {
        AdminError::MissingCluster(path.as_ref().to_path_buf())
    }
}
