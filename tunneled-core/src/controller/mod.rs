//! VPN backends
//!
//! A backend answers "is this connection up?" and can move it between
//! [`ResourceState::Up`] and [`ResourceState::Down`]. Two backends exist:
//! [`ProcessController`] owns an OpenVPN process directly and remembers its
//! pid in the connection record, [`ServiceController`] drives a systemd
//! unit. The connection manager only sees the [`ResourceController`] trait.

pub mod process;
pub mod service;

pub use process::ProcessController;
pub use service::ServiceController;

use std::time::Duration;

use crate::config::{toml_config, Backend, TunneledConfig};
use crate::error::{ControllerError, Result};
use crate::state::ConnectionRecord;

/// Running state of a VPN connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Up,
    Down,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceState::Up => write!(f, "up"),
            ResourceState::Down => write!(f, "down"),
        }
    }
}

/// Capability every VPN backend provides
///
/// Both methods get the persisted record of the connection; backends that
/// track the VPN themselves may ignore it.
pub trait ResourceController {
    /// Whether connection `name` is currently in `target`
    fn is_in_state(
        &self,
        name: &str,
        record: &ConnectionRecord,
        target: ResourceState,
    ) -> std::result::Result<bool, ControllerError>;

    /// Move connection `name` to `target`
    ///
    /// With `blocking`, return only once `target` has been observed.
    fn transition(
        &self,
        name: &str,
        record: &mut ConnectionRecord,
        target: ResourceState,
        blocking: bool,
    ) -> std::result::Result<(), ControllerError>;
}

/// The configured backend
#[derive(Debug, Clone)]
pub enum Controller {
    Process(ProcessController),
    Service(ServiceController),
}

impl Controller {
    /// Build the backend selected in `config`
    pub fn from_config(config: &TunneledConfig) -> Result<Self> {
        match config.backend {
            Backend::Process => {
                let settings = &config.process;
                let config_dir = match &settings.config_dir {
                    Some(dir) => dir.clone(),
                    None => toml_config::get_config_dir()?,
                };
                Ok(Controller::Process(ProcessController::new(
                    &settings.binary,
                    config_dir,
                    Duration::from_secs(settings.stop_timeout_secs),
                )?))
            }
            Backend::Service => {
                let settings = &config.service;
                Ok(Controller::Service(ServiceController::new(
                    &settings.command,
                    settings.unit_template.clone(),
                    Duration::from_millis(settings.poll_interval_ms),
                    Duration::from_secs(settings.poll_timeout_secs),
                )?))
            }
        }
    }
}

impl ResourceController for Controller {
    fn is_in_state(
        &self,
        name: &str,
        record: &ConnectionRecord,
        target: ResourceState,
    ) -> std::result::Result<bool, ControllerError> {
        match self {
            Controller::Process(c) => c.is_in_state(name, record, target),
            Controller::Service(c) => c.is_in_state(name, record, target),
        }
    }

    fn transition(
        &self,
        name: &str,
        record: &mut ConnectionRecord,
        target: ResourceState,
        blocking: bool,
    ) -> std::result::Result<(), ControllerError> {
        match self {
            Controller::Process(c) => c.transition(name, record, target, blocking),
            Controller::Service(c) => c.transition(name, record, target, blocking),
        }
    }
}

/// Resolve `program` through `PATH` unless it already names a path
pub(crate) fn resolve_binary(
    program: impl AsRef<std::ffi::OsStr>,
) -> std::result::Result<std::path::PathBuf, ControllerError> {
    let program = program.as_ref();
    which::which(program).map_err(|e| ControllerError::BinaryNotFound {
        name: program.to_string_lossy().to_string(),
        reason: e.to_string(),
    })
}
