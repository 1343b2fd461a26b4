//! Cross-process exclusive lock
//!
//! The lock is a marker file whose mere existence means "held". It is
//! created with exclusive-create semantics (`O_CREAT | O_EXCL`), which is the
//! only source of mutual exclusion: of any number of racing creators exactly
//! one succeeds.
//!
//! # Waiting
//!
//! A blocked acquirer does not poll the filesystem. It registers an inotify
//! watch on the marker and sleeps until the marker is deleted or the
//! remaining timeout runs out, then tries the exclusive create again. A wake
//! is only a hint: a third process may have re-created the marker in the
//! meantime, in which case the waiter goes back to sleep with whatever budget
//! is left.
//!
//! Between a deletion and the next successful create, every waiter races for
//! the marker. Exclusive create still admits only one of them, so the
//! residual risk is starvation of an unlucky waiter, never two holders.
//!
//! # Stale markers
//!
//! A marker left behind by a holder that died without running its guard's
//! finalizer blocks everyone. There is no automatic staleness detection;
//! [`clear_lock`] (`tunneled clear-lock`) is the recovery path.

mod guard;
mod timeout;
mod wait;

pub use guard::LockGuard;
pub use timeout::LockTimeout;

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};

use crate::error::LockError;

/// Default marker path
pub const DEFAULT_LOCK_PATH: &str = "/tmp/.tunneled-lock";

/// Filesystem-marker lock usable across unrelated processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Create a lock handle for the given marker path
    ///
    /// Nothing touches the filesystem until [`FileLock::acquire`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the marker file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether some process currently holds the lock
    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Try to take the lock
    ///
    /// Returns `Ok(Some(guard))` once the marker was created by this call and
    /// `Ok(None)` when the lock is held elsewhere and either `blocking` is
    /// false or `timeout` ran out. Running out of time is not an error.
    pub fn acquire(
        &self,
        blocking: bool,
        timeout: LockTimeout,
    ) -> Result<Option<LockGuard>, LockError> {
        self.ensure_parent()?;

        let mut remaining = timeout.budget();

        loop {
            match self.try_create() {
                Ok(()) => {
                    debug!("Acquired lock {}", self.path.display());
                    return Ok(Some(LockGuard::new(self.path.clone())));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(LockError::CreateFailed {
                        path: self.path.clone(),
                        source: e,
                    })
                }
            }

            if !blocking || remaining.is_some_and(|r| r.is_zero()) {
                debug!("Lock {} is held elsewhere, giving up", self.path.display());
                return Ok(None);
            }

            let started = Instant::now();
            wait::until_removed(&self.path, remaining)?;
            if let Some(r) = remaining {
                remaining = Some(r.saturating_sub(started.elapsed()));
            }
        }
    }

    fn try_create(&self) -> std::io::Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map(drop)
    }

    fn ensure_parent(&self) -> Result<(), LockError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
                fs::create_dir_all(parent).map_err(|e| LockError::CreateFailed {
                    path: self.path.clone(),
                    source: e,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Forcefully remove a lock marker
///
/// This is the operator's recovery path for a stale lock. The caller is
/// responsible for making sure the previous holder is really gone.
/// Returns `false` when there was no marker to remove.
pub fn clear_lock(path: &Path) -> Result<bool, LockError> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!("Cleared lock {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LockError::ReleaseFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests;
