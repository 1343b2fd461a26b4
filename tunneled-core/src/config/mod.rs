//! Configuration module
//!
//! Every path and timeout the connection manager relies on is configurable
//! here, with defaults matching a stock installation. The file is optional.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::controller::service::NAME_PLACEHOLDER;
use crate::error::LockError;
use crate::lock::{LockTimeout, DEFAULT_LOCK_PATH};
use crate::state::DEFAULT_STATE_PATH;

pub mod toml_config;

/// Default root of the per-connection net_cls control groups
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/net_cls/tunneled";

/// Which backend starts and stops the VPN
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Spawn OpenVPN ourselves and track its pid
    #[default]
    Process,
    /// Start and stop a systemd unit
    Service,
}

/// Complete tunneled configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunneledConfig {
    /// Lock marker guarding the state file and the VPN
    pub lock_path: PathBuf,

    /// Persisted connection state
    pub state_path: PathBuf,

    /// Seconds to wait for the lock, -1 for no limit
    pub lock_timeout_secs: f64,

    /// Directory holding one net_cls control group per connection
    pub cgroup_root: PathBuf,

    pub backend: Backend,

    /// Wait until the VPN is confirmed up before running the program
    pub blocking_start: bool,

    /// Wait until the VPN is confirmed down before exiting
    pub blocking_stop: bool,

    pub process: ProcessSettings,

    pub service: ServiceSettings,
}

impl Default for TunneledConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            lock_timeout_secs: -1.0,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            backend: Backend::default(),
            blocking_start: true,
            blocking_stop: true,
            process: ProcessSettings::default(),
            service: ServiceSettings::default(),
        }
    }
}

impl TunneledConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.lock_timeout().map_err(|e| e.to_string())?;

        if self.lock_path == self.state_path {
            return Err("Lock path and state path must differ".to_string());
        }

        if self.process.binary.as_os_str().is_empty() {
            return Err("OpenVPN binary cannot be empty".to_string());
        }

        if self.service.command.is_empty() {
            return Err("Service manager command cannot be empty".to_string());
        }

        if !self.service.unit_template.contains(NAME_PLACEHOLDER) {
            return Err(format!(
                "Unit template must contain {}",
                NAME_PLACEHOLDER
            ));
        }

        if self.service.poll_interval_ms == 0 {
            return Err("Poll interval cannot be zero".to_string());
        }

        Ok(())
    }

    /// Lock timeout as a [`LockTimeout`]
    pub fn lock_timeout(&self) -> Result<LockTimeout, LockError> {
        LockTimeout::from_secs_f64(self.lock_timeout_secs)
    }
}

/// Settings of the direct OpenVPN backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// OpenVPN executable
    pub binary: PathBuf,

    /// Directory of `<name>.conf` files (default: the configuration directory)
    pub config_dir: Option<PathBuf>,

    /// Seconds to wait for OpenVPN to exit after SIGTERM before SIGKILL
    pub stop_timeout_secs: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/sbin/openvpn"),
            config_dir: None,
            stop_timeout_secs: 5,
        }
    }
}

/// Settings of the systemd backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service manager command and leading arguments
    pub command: Vec<String>,

    /// Unit name, `{name}` is replaced by the connection name
    pub unit_template: String,

    /// Milliseconds between status checks of a blocking transition
    pub poll_interval_ms: u64,

    /// Seconds before a blocking transition gives up
    pub poll_timeout_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            command: vec!["systemctl".to_string()],
            unit_template: format!("openvpn-client@{}.service", NAME_PLACEHOLDER),
            poll_interval_ms: 100,
            poll_timeout_secs: 30,
        }
    }
}
