//! Configuration module
//!
//! Settings for the scheduler, the three monitors and the tunnel
//! integration, loaded from and saved to TOML files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod toml_config;

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum time between two checks of the pending task list
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

fn default_check_interval() -> u64 {
    10
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.check_interval_secs < 1 || self.check_interval_secs > 300 {
            return Err(format!(
                "check_interval_secs must be between 1 and 300, got: {}",
                self.check_interval_secs
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
        }
    }
}

/// How network reachability is probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    /// `ip route get` against a documentation address
    #[default]
    IpRoute,
    /// NetworkManager's global connectivity state over D-Bus
    NetworkManager,
}

/// Network monitor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMonitorConfig {
    #[serde(default = "default_network_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub probe: ProbeKind,
}

fn default_network_poll_interval() -> u64 {
    5000
}

impl NetworkMonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms < 100 {
            return Err(format!(
                "network poll_interval_ms must be at least 100, got: {}",
                self.poll_interval_ms
            ));
        }
        Ok(())
    }
}

impl Default for NetworkMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_network_poll_interval(),
            probe: ProbeKind::default(),
        }
    }
}

/// Where session lock notifications come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionBackend {
    /// systemd-logind `Lock`/`Unlock` signals on the seat's active session
    #[default]
    Logind,
    /// No lock notifications; `assume_unlocked` decides
    None,
}

/// Session monitor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMonitorConfig {
    #[serde(default)]
    pub backend: SessionBackend,

    /// Lock state reported before (or without) any notification
    #[serde(default = "default_assume_unlocked")]
    pub assume_unlocked: bool,
}

fn default_assume_unlocked() -> bool {
    true
}

impl Default for SessionMonitorConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::default(),
            assume_unlocked: default_assume_unlocked(),
        }
    }
}

/// How the daemon observes and restarts the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Network interface created by the VPN client (e.g. "tun0")
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Shell command that re-establishes the tunnel
    #[serde(default)]
    pub reconnect_command: Option<String>,

    #[serde(default = "default_tunnel_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_interface() -> String {
    "tun0".to_string()
}

fn default_tunnel_poll_interval() -> u64 {
    2000
}

impl TunnelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interface.is_empty() {
            return Err("Tunnel interface cannot be empty".to_string());
        }

        // Interface names are at most IFNAMSIZ - 1 bytes and never contain '/'
        if self.interface.len() > 15 || self.interface.contains('/') {
            return Err(format!("Invalid tunnel interface name: {}", self.interface));
        }

        if let Some(command) = &self.reconnect_command {
            if command.trim().is_empty() {
                return Err("reconnect_command cannot be empty".to_string());
            }
        }

        if self.poll_interval_ms < 100 {
            return Err(format!(
                "tunnel poll_interval_ms must be at least 100, got: {}",
                self.poll_interval_ms
            ));
        }
        Ok(())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            reconnect_command: None,
            poll_interval_ms: default_tunnel_poll_interval(),
        }
    }
}
