//! User configuration.
//!
//! Persisted as TOML in the platform configuration directory. A missing file
//! yields the defaults.

use crate::merge::MergeRequest;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_FILE: &str = "config.toml";

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration directory available on this system")]
    NoConfigDir,

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Merge preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Create the merge on startup
    pub enabled: bool,
    pub primary_uid: String,
    pub secondary_uid: String,
    /// Primary plays left, secondary plays right
    pub stereo_split: bool,
    /// Balance follows the focused window (requires `stereo_split`)
    pub spatial_audio: bool,
    /// Unmerge when either endpoint disconnects
    pub unmerge_on_disconnect: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            primary_uid: String::new(),
            secondary_uid: String::new(),
            stereo_split: false,
            spatial_audio: false,
            unmerge_on_disconnect: true,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub merge: MergeConfig,
    /// Log filter used when `RUST_LOG` is unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl AppConfig {
    /// Default location, `<config dir>/VolumeMaster/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("com", "volumemaster", "VolumeMaster")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Both merge endpoints are set.
    pub fn has_merge_devices_configured(&self) -> bool {
        !self.merge.primary_uid.is_empty() && !self.merge.secondary_uid.is_empty()
    }

    /// The merge described by this configuration, if both endpoints are set.
    pub fn merge_request(&self) -> Option<MergeRequest> {
        self.has_merge_devices_configured().then(|| MergeRequest {
            primary_uid: self.merge.primary_uid.clone(),
            secondary_uid: self.merge.secondary_uid.clone(),
            stereo_split: self.merge.stereo_split,
            spatial: self.merge.spatial_audio,
        })
    }
}
