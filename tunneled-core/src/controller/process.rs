//! OpenVPN process backend
//!
//! Starts OpenVPN directly and keeps its pid in the connection record. The
//! pid is the whole state: a recorded pid whose process still exists means
//! the connection is up.

use std::ffi::OsStr;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{setsid, Pid};
use tracing::{debug, info, warn};

use super::{resolve_binary, ResourceController, ResourceState};
use crate::error::ControllerError;
use crate::state::ConnectionRecord;

/// Interval between liveness checks while waiting for OpenVPN to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait after SIGKILL before giving up
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Backend that owns the OpenVPN process itself
///
/// Liveness is judged by pid alone. A zombie that some other process has
/// not reaped yet, or an unrelated process that was given the same pid,
/// counts as up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessController {
    binary: PathBuf,
    config_dir: PathBuf,
    stop_timeout: Duration,
}

impl ProcessController {
    /// Create a backend running `binary` with configurations from `config_dir`
    ///
    /// `binary` is looked up in `PATH` unless it is a path. `stop_timeout`
    /// bounds the wait for a graceful exit before SIGKILL is sent.
    pub fn new(
        binary: impl AsRef<OsStr>,
        config_dir: impl Into<PathBuf>,
        stop_timeout: Duration,
    ) -> Result<Self, ControllerError> {
        Ok(Self {
            binary: resolve_binary(binary)?,
            config_dir: config_dir.into(),
            stop_timeout,
        })
    }

    /// OpenVPN configuration file for connection `name`
    ///
    /// The first `.` of the name separates a subdirectory, so `work.office`
    /// maps to `<config_dir>/work/office.conf`.
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir
            .join(format!("{}.conf", name.replacen('.', "/", 1)))
    }

    fn current_state(&self, name: &str, record: &ConnectionRecord) -> ResourceState {
        match record.pid {
            Some(pid) if is_alive(Pid::from_raw(pid)) => ResourceState::Up,
            Some(pid) => {
                warn!("OpenVPN for {} (pid {}) is no longer running", name, pid);
                ResourceState::Down
            }
            None => ResourceState::Down,
        }
    }

    fn start(&self, name: &str, record: &mut ConnectionRecord) -> Result<(), ControllerError> {
        let config = self.config_path(name);

        let mut cmd = Command::new(&self.binary);
        cmd.arg(&config)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own session, so the VPN outlives the terminal of whoever started it
        unsafe {
            cmd.pre_exec(|| setsid().map(drop).map_err(std::io::Error::from));
        }

        let child = cmd.spawn().map_err(|e| ControllerError::SpawnFailed {
            program: self.binary.display().to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id() as i32;
        record.pid = Some(pid);
        info!(
            "Started OpenVPN for {} with {} (pid {})",
            name,
            config.display(),
            pid
        );
        Ok(())
    }

    fn stop(
        &self,
        name: &str,
        record: &mut ConnectionRecord,
        blocking: bool,
    ) -> Result<(), ControllerError> {
        let Some(raw_pid) = record.pid else {
            debug!("No OpenVPN pid recorded for {}", name);
            return Ok(());
        };
        let pid = Pid::from_raw(raw_pid);

        debug!("Sending SIGTERM to OpenVPN for {} (pid {})", name, raw_pid);
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!("Process {} already terminated", raw_pid);
                record.pid = None;
                return Ok(());
            }
            Err(e) => {
                return Err(ControllerError::SignalFailed {
                    pid: raw_pid,
                    reason: e.to_string(),
                })
            }
        }

        if blocking && !wait_for_exit(pid, self.stop_timeout) {
            warn!(
                "OpenVPN for {} (pid {}) did not exit within {:?}, sending SIGKILL",
                name, raw_pid, self.stop_timeout
            );
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(ControllerError::SignalFailed {
                        pid: raw_pid,
                        reason: e.to_string(),
                    })
                }
            }

            if !wait_for_exit(pid, KILL_GRACE) {
                return Err(ControllerError::TransitionFailed {
                    name: name.to_string(),
                    target: ResourceState::Down.to_string(),
                    reason: format!("process {} did not respond to SIGKILL", raw_pid),
                });
            }
        }

        record.pid = None;
        info!("Stopped OpenVPN for {} (pid {})", name, raw_pid);
        Ok(())
    }
}

impl ResourceController for ProcessController {
    fn is_in_state(
        &self,
        name: &str,
        record: &ConnectionRecord,
        target: ResourceState,
    ) -> Result<bool, ControllerError> {
        Ok(self.current_state(name, record) == target)
    }

    fn transition(
        &self,
        name: &str,
        record: &mut ConnectionRecord,
        target: ResourceState,
        blocking: bool,
    ) -> Result<(), ControllerError> {
        match target {
            // Spawning is synchronous, there is nothing to wait for
            ResourceState::Up => self.start(name, record),
            ResourceState::Down => self.stop(name, record, blocking),
        }
    }
}

/// Whether `pid` still runs
///
/// A process we spawned ourselves stays a zombie until reaped, so try to
/// reap it first; for anyone else's process fall back to signal 0.
fn is_alive(pid: Pid) -> bool {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => false,
        Ok(_) => true,
        Err(_) => !matches!(kill(pid, None), Err(Errno::ESRCH)),
    }
}

fn wait_for_exit(pid: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if !is_alive(pid) {
            return true;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}
