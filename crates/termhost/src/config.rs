//! Host configuration, read from the JSON file named by `TERMHOST_CONFIG`.
//!
//! Every field is optional; missing ones take their defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use termhost_channel::ChannelConfig;
use thiserror::Error;

use crate::guard::SuppressionConfig;
use crate::output::DEFAULT_CHUNK_SIZE;

pub const CONFIG_ENV: &str = "TERMHOST_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Largest `data` payload sent upstream, in bytes.
    pub chunk_size: usize,
    pub suppression: SuppressionConfig,
    pub channel: ChannelConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            suppression: SuppressionConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl HostConfig {
    /// Load from `$TERMHOST_CONFIG`, or use defaults when it is unset.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if config.chunk_size == 0 {
            log::warn!("chunk_size 0 in {}; using {DEFAULT_CHUNK_SIZE}", path.display());
            config.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        log::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
