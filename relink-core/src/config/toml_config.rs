//! TOML configuration file I/O
//!
//! Handles loading and saving the relink configuration to/from TOML files
//! in the user's configuration directory.

use crate::config::{NetworkMonitorConfig, SchedulerConfig, SessionMonitorConfig, TunnelConfig};
use crate::error::{ConfigError, RelinkError};
use crate::vpn::reconnection::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Complete TOML configuration structure
///
/// Every section is optional and falls back to its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelinkConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    #[serde(default)]
    pub network: NetworkMonitorConfig,

    #[serde(default)]
    pub session: SessionMonitorConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl RelinkConfig {
    /// Validate every section, reporting the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::ValidationError { message };

        self.scheduler.validate().map_err(invalid)?;
        self.backoff.validate().map_err(|e| ConfigError::ValidationError {
            message: format!("Invalid backoff policy: {}", e),
        })?;
        self.network.validate().map_err(invalid)?;
        self.tunnel.validate().map_err(invalid)?;
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, RelinkError> {
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RelinkError::Config(ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            }),
            _ => RelinkError::Config(ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            }),
        })?;

        let config: RelinkConfig = toml::from_str(&contents).map_err(|e| {
            RelinkError::Config(ConfigError::ValidationError {
                message: format!("Failed to parse config file: {}", e),
            })
        })?;

        config.validate().map_err(|e| {
            warn!("Configuration validation failed: {}", e);
            RelinkError::Config(e)
        })?;

        info!(
            "Loaded configuration: check_interval={}s, backoff_base={}, jitter={}..{}, network_poll={}ms, probe={:?}, session_backend={:?}, interface={}",
            config.scheduler.check_interval_secs,
            config.backoff.base,
            config.backoff.jitter_min,
            config.backoff.jitter_max,
            config.network.poll_interval_ms,
            config.network.probe,
            config.session.backend,
            config.tunnel.interface
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), RelinkError> {
        self.validate()?;

        let contents = toml::to_string_pretty(self)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RelinkError::Config(ConfigError::IoError {
                    message: format!("Failed to create config directory: {}", e),
                })
            })?;
        }

        std::fs::write(path, contents).map_err(|_e| {
            RelinkError::Config(ConfigError::SaveFailed {
                path: path.to_string_lossy().to_string(),
            })
        })?;

        debug!("Saved configuration to {:?}", path);
        Ok(())
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/relink, or RELINK_CONFIG_DIR if set
pub fn get_config_dir() -> Result<PathBuf, RelinkError> {
    if let Ok(config_dir) = std::env::var("RELINK_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = std::env::var("HOME").map_err(|_| {
        RelinkError::Config(ConfigError::IoError {
            message: "HOME environment variable not set".to_string(),
        })
    })?;

    Ok(PathBuf::from(home).join(".config").join("relink"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, RelinkError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the configuration from `path`, or from the default location
///
/// A missing file at the default location is not an error: the daemon runs
/// with defaults. A missing explicit path is.
pub fn load_config(path: Option<&Path>) -> Result<RelinkConfig, RelinkError> {
    if let Some(path) = path {
        return RelinkConfig::from_file(path);
    }

    let default_path = get_config_path()?;
    if default_path.exists() {
        RelinkConfig::from_file(&default_path)
    } else {
        debug!(
            "No configuration file at {:?}, using defaults",
            default_path
        );
        Ok(RelinkConfig::default())
    }
}
