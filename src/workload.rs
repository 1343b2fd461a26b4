//! Running the tunneled program
//!
//! The program is forked from this (privileged) process. Between fork and
//! exec the child gives up privilege for good and writes its own pid into
//! the connection's control group `tasks` file. The parent stays around on a
//! single-threaded tokio runtime until the child exits, so that it can
//! release the connection afterwards.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};
use tunneled_core::error::{TunneledError, WorkloadError};
use tunneled_core::privilege::{as_real_user, drop_permanently};

/// Control group `tasks` file of connection `vpn`
pub fn tasks_path(cgroup_root: &Path, vpn: &str) -> PathBuf {
    cgroup_root.join(vpn).join("tasks")
}

/// Open the `tasks` file the child will join
///
/// Opened as the invoking user: the program must not end up in a control
/// group that user could not have joined on their own.
pub fn open_tasks(path: &Path) -> Result<File, TunneledError> {
    as_real_user(|| {
        OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| {
                WorkloadError::CgroupUnavailable {
                    path: path.to_path_buf(),
                    source,
                }
                .into()
            })
    })
}

/// Run `program` inside the control group behind `tasks` and wait for it
///
/// Returns the exit code to pass on: the program's own, or `128 + signal`
/// if it was killed.
pub fn run(program: &str, args: &[String], tasks: File) -> Result<i32, WorkloadError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(WorkloadError::Supervise)?;

    let status = runtime.block_on(supervise(program, args, tasks))?;
    Ok(exit_code(status))
}

async fn supervise(program: &str, args: &[String], tasks: File) -> Result<ExitStatus, WorkloadError> {
    // Register before spawning so no signal slips through unhandled
    let mut interrupt = signal(SignalKind::interrupt()).map_err(WorkloadError::Supervise)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(WorkloadError::Supervise)?;
    let mut hangup = signal(SignalKind::hangup()).map_err(WorkloadError::Supervise)?;

    let tasks_fd = tasks.as_raw_fd();
    let mut command = Command::new(program);
    command.args(args);

    // SAFETY: the hook only makes raw system calls and does not allocate,
    // so it is safe to run in the forked child.
    unsafe {
        command.pre_exec(move || {
            drop_permanently().map_err(io::Error::from)?;
            join_cgroup(tasks_fd)
        });
    }

    let mut child = command
        .spawn()
        .map_err(|source| WorkloadError::SpawnFailed {
            program: program.to_string(),
            source,
        })?;
    drop(tasks);

    let pid = child.id().map(|id| Pid::from_raw(id as i32));
    info!("Started {} as pid {:?}", program, pid);

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|source| WorkloadError::WaitFailed {
                    program: program.to_string(),
                    source,
                })?;
                debug!("{} exited with {}", program, status);
                return Ok(status);
            }
            // The terminal already delivers ^C to the whole foreground group
            _ = interrupt.recv() => debug!("Interrupted, waiting for {} to exit", program),
            _ = terminate.recv() => forward(pid, Signal::SIGTERM),
            _ = hangup.recv() => forward(pid, Signal::SIGHUP),
        }
    }
}

fn forward(pid: Option<Pid>, sig: Signal) {
    let Some(pid) = pid else {
        return;
    };
    debug!("Forwarding {} to {}", sig, pid);
    if let Err(e) = kill(pid, sig) {
        warn!("Could not forward {} to {}: {}", sig, pid, e);
    }
}

/// Write this process's pid into the `tasks` file behind `fd`
///
/// Runs between fork and exec.
fn join_cgroup(fd: RawFd) -> io::Result<()> {
    let mut buf = [0u8; 20];
    let pid = format_pid(getpid().as_raw(), &mut buf);

    // SAFETY: the parent keeps the file open until spawn has returned
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let written = nix::unistd::write(fd, pid)?;
    if written != pid.len() {
        return Err(io::Error::from(io::ErrorKind::WriteZero));
    }
    Ok(())
}

/// Decimal digits of `pid`, formatted into `buf`
fn format_pid(pid: i32, buf: &mut [u8; 20]) -> &[u8] {
    let mut n = pid.unsigned_abs();
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[start..]
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}
