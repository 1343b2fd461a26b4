//! RAII guard for a held lock marker.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::{debug, error};

use crate::error::LockError;

/// Proof that this process holds the lock
///
/// Dropping the guard removes the marker. A marker that is already gone is
/// fine there; any other failure is logged and swallowed, since a finalizer
/// must not panic. Call [`LockGuard::release`] to get release failures as
/// errors instead.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub(super) fn new(path: PathBuf) -> Self {
        Self {
            path,
            released: false,
        }
    }

    /// Release the lock, reporting any failure
    ///
    /// A missing marker is an error here: someone removed a lock they did not
    /// hold, so mutual exclusion may already have been violated.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        fs::remove_file(&self.path).map_err(|e| LockError::ReleaseFailed {
            path: self.path.clone(),
            source: e,
        })?;
        debug!("Released lock {}", self.path.display());
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {} on drop", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!("Could not release lock {}: {}", self.path.display(), e),
        }
    }
}
