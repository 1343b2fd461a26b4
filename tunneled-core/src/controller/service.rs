//! systemd unit backend
//!
//! The service manager owns the OpenVPN process; we only ask it for status
//! and to start or stop the unit. Status comes from the exit code of
//! `systemctl is-active --quiet <unit>`.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{resolve_binary, ResourceController, ResourceState};
use crate::error::ControllerError;
use crate::state::ConnectionRecord;

/// `systemctl is-active` exit code for an active unit
const STATUS_ACTIVE: i32 = 0;

/// `systemctl is-active` exit code for an inactive or failed unit
const STATUS_INACTIVE: i32 = 3;

/// Placeholder replaced by the connection name in unit templates
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Backend that drives a systemd unit per connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceController {
    program: PathBuf,
    leading_args: Vec<OsString>,
    unit_template: String,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl ServiceController {
    /// Create a backend invoking `command` (program plus leading arguments,
    /// e.g. `["systemctl", "--user"]`)
    ///
    /// Blocking transitions check the unit every `poll_interval` and give up
    /// after `poll_timeout`.
    pub fn new<S: AsRef<str>>(
        command: &[S],
        unit_template: impl Into<String>,
        poll_interval: Duration,
        poll_timeout: Duration,
    ) -> Result<Self, ControllerError> {
        let (program, leading_args) =
            command
                .split_first()
                .ok_or_else(|| ControllerError::BinaryNotFound {
                    name: String::new(),
                    reason: "empty service manager command".to_string(),
                })?;

        Ok(Self {
            program: resolve_binary(program.as_ref())?,
            leading_args: leading_args
                .iter()
                .map(|arg| OsString::from(arg.as_ref()))
                .collect(),
            unit_template: unit_template.into(),
            poll_interval,
            poll_timeout,
        })
    }

    /// Unit name for connection `name`
    pub fn unit_name(&self, name: &str) -> String {
        self.unit_template.replace(NAME_PLACEHOLDER, name)
    }

    fn run(&self, args: &[&str]) -> Result<ExitStatus, ControllerError> {
        Command::new(&self.program)
            .args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ControllerError::SpawnFailed {
                program: self.program.display().to_string(),
                reason: e.to_string(),
            })
    }

    fn status(&self, name: &str) -> Result<ResourceState, ControllerError> {
        let unit = self.unit_name(name);
        let status = self.run(&["is-active", "--quiet", &unit])?;

        match status.code() {
            Some(STATUS_ACTIVE) => Ok(ResourceState::Up),
            Some(STATUS_INACTIVE) => Ok(ResourceState::Down),
            code => Err(ControllerError::UnexpectedStatus { name: unit, code }),
        }
    }

    fn wait_for(&self, name: &str, target: ResourceState) -> Result<(), ControllerError> {
        // A timeout past the end of time means no deadline
        let deadline = Instant::now().checked_add(self.poll_timeout);
        loop {
            if self.status(name)? == target {
                return Ok(());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(ControllerError::Timeout {
                    name: self.unit_name(name),
                    target: target.to_string(),
                    seconds: self.poll_timeout.as_secs(),
                });
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl ResourceController for ServiceController {
    fn is_in_state(
        &self,
        name: &str,
        _record: &ConnectionRecord,
        target: ResourceState,
    ) -> Result<bool, ControllerError> {
        Ok(self.status(name)? == target)
    }

    fn transition(
        &self,
        name: &str,
        _record: &mut ConnectionRecord,
        target: ResourceState,
        blocking: bool,
    ) -> Result<(), ControllerError> {
        let unit = self.unit_name(name);
        let verb = match target {
            ResourceState::Up => "start",
            ResourceState::Down => "stop",
        };

        debug!("Running {} {} for {}", verb, unit, name);
        let status = self.run(&[verb, &unit])?;
        if !status.success() {
            return Err(ControllerError::TransitionFailed {
                name: unit,
                target: target.to_string(),
                reason: format!("{} exited with {}", verb, status),
            });
        }

        if blocking {
            self.wait_for(name, target)?;
        }

        info!("Unit {} is {}", unit, target);
        Ok(())
    }
}
