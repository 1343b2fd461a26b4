//! Notification-driven wait for a marker's removal.

use std::os::fd::AsFd;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use tracing::trace;

use crate::error::LockError;

/// Sleep until `path` is deleted or `remaining` elapses
///
/// Returning says nothing about who holds the lock now; the caller must
/// retry its exclusive create. Waits longer than a `u16` of milliseconds are
/// cut short and the caller's loop simply waits again.
pub(super) fn until_removed(path: &Path, remaining: Option<Duration>) -> Result<(), LockError> {
    let wait_failed = |source: Errno| LockError::WaitFailed {
        path: path.to_path_buf(),
        source,
    };

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC).map_err(wait_failed)?;

    match inotify.add_watch(path, AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_MOVE_SELF) {
        Ok(_) => {}
        // Removed between our failed create and the watch: go straight back
        Err(Errno::ENOENT) => return Ok(()),
        Err(e) => return Err(wait_failed(e)),
    }

    trace!("Waiting for {} to be removed", path.display());

    let mut fds = [PollFd::new(inotify.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, poll_timeout(remaining)) {
        Ok(0) => Ok(()),
        Ok(_) => {
            // Drain so the events are not misread later; the fd is dropped anyway
            let _ = inotify.read_events();
            Ok(())
        }
        Err(Errno::EINTR) => Ok(()),
        Err(e) => Err(wait_failed(e)),
    }
}

fn poll_timeout(remaining: Option<Duration>) -> PollTimeout {
    match remaining {
        None => PollTimeout::NONE,
        Some(d) => PollTimeout::from(wait_millis(d)),
    }
}

// Rounded up so we never wake before the deadline and spin
fn wait_millis(d: Duration) -> u16 {
    u16::try_from(d.as_nanos().div_ceil(1_000_000)).unwrap_or(u16::MAX)
}
