use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use heapvac::vacuum::VacuumConfig;
use serde::Deserialize;
use thiserror::Error;

/// Named cluster settings selected with `--profile`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    pub cluster: Option<PathBuf>,
    pub database: Option<String>,
    pub page_size: Option<usize>,
    pub lock_timeout_ms: Option<u64>,
    pub max_fsm_pages: Option<usize>,
}

#[derive(Debug, Default)]
pub struct CliConfig {
    data: RawConfig,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.clone().or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            Some(config_path) if explicit.is_some() => {
                return Err(ConfigError::Missing {
                    path: config_path.clone(),
                })
            }
            _ => RawConfig::default(),
        };
        if let Some(name) = data.default_profile.as_ref() {
            if !data.profiles.contains_key(name) {
                return Err(ConfigError::ProfileNotFound { name: name.clone() });
            }
        }
        Ok(Self { data })
    }

    /// Settings from `[cluster]` overlaid with the selected profile.
    pub fn resolve(&self, profile: Option<&str>) -> Result<Profile, ConfigError> {
        let mut merged = self.data.cluster.clone();
        let name = profile.or(self.data.default_profile.as_deref());
        if let Some(name) = name {
            let chosen = self
                .data
                .profiles
                .get(name)
                .ok_or_else(|| ConfigError::ProfileNotFound {
                    name: name.to_string(),
                })?;
            merged.cluster = chosen.cluster.clone().or(merged.cluster);
            merged.database = chosen.database.clone().or(merged.database);
            merged.page_size = chosen.page_size.or(merged.page_size);
            merged.lock_timeout_ms = chosen.lock_timeout_ms.or(merged.lock_timeout_ms);
            merged.max_fsm_pages = chosen.max_fsm_pages.or(merged.max_fsm_pages);
        }
        Ok(merged)
    }

    pub fn vacuum(&self) -> &VacuumConfig {
        &self.data.vacuum
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    cluster: Profile,
    #[serde(default)]
    vacuum: VacuumConfig,
    #[serde(default)]
    profiles: HashMap<String, Profile>,
    #[serde(default)]
    default_profile: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("CLI config {path} does not exist")]
    Missing { path: PathBuf },
    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("heapvac").join("cli.toml"))
}
