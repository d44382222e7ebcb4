//! Configuration surface consumed from the external configurator.
//!
//! Recognized options: the encryption secret, the mount point, the set of
//! enabled drives with per-provider settings, and optionally the flush
//! interval and cache directory. Unknown options are rejected at parse time.

use crate::drive::{Drive, LocalFsDrive, MemoryDrive};
use crate::error::FsError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// User-supplied secret the encryption key is derived from.
    pub secret: String,

    /// Directory the filesystem is mounted on.
    pub mount_point: PathBuf,

    /// Local directory for the body cache and the catalog working copy.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Seconds between flusher ticks.
    #[serde(default)]
    pub flush_interval_secs: Option<u64>,

    /// Enabled drives; at least one is required.
    pub drives: Vec<DriveConfig>,
}

/// Per-provider drive configuration.
///
/// Hosted providers (Dropbox, Google Drive, ...) plug in through the same
/// [`Drive`] trait via their own adapter crates; this enum covers the
/// adapters built here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", deny_unknown_fields)]
pub enum DriveConfig {
    #[serde(rename = "localfs")]
    LocalFs {
        /// Scheme used in catalog urls, e.g. `vault://object.bin`.
        name: String,
        root: PathBuf,
        /// Advertised capacity in bytes.
        capacity: u64,
    },
    #[serde(rename = "memory")]
    Memory { name: String, capacity: u64 },
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Parse("secret must not be empty".into()));
        }
        if self.drives.is_empty() {
            return Err(ConfigError::Parse("at least one drive is required".into()));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(
            self.flush_interval_secs
                .unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS),
        )
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("cloudstash"))
    }

    /// Instantiate the configured drive set.
    pub async fn build_drives(&self) -> Result<Vec<Arc<dyn Drive>>, FsError> {
        let mut drives: Vec<Arc<dyn Drive>> = Vec::with_capacity(self.drives.len());
        for dc in &self.drives {
            match dc {
                DriveConfig::LocalFs {
                    name,
                    root,
                    capacity,
                } => {
                    drives.push(Arc::new(
                        LocalFsDrive::new(name.clone(), root.clone(), *capacity).await?,
                    ));
                }
                DriveConfig::Memory { name, capacity } => {
                    drives.push(Arc::new(MemoryDrive::new(name.clone(), *capacity)));
                }
            }
        }
        Ok(drives)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),
}
