//! Reference-counted connection management
//!
//! Any number of unrelated `tunneled` processes may want the same VPN. The
//! first one starts it, the last one stops it. The use count lives in the
//! persisted state and is only touched while the cross-process lock is
//! held, inside one critical section:
//!
//! ```text
//! lock → load (as real user) → check/transition backend (elevated)
//!      → update use count → save (as real user) → unlock
//! ```
//!
//! The backend transition always happens before the new count is saved, so
//! a failed start or stop leaves the state file as it was.

use tracing::{debug, error, info, warn};

use crate::config::TunneledConfig;
use crate::controller::{Controller, ResourceController, ResourceState};
use crate::error::{ManagerError, Result, TunneledError};
use crate::lock::{FileLock, LockGuard, LockTimeout};
use crate::privilege::{as_real_user, with_real_elevated};
use crate::state::{PersistedState, StateStore};

/// Knobs of the critical section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    /// How long acquire and release wait for the lock
    pub lock_timeout: LockTimeout,
    /// Wait until the VPN is observed up on first acquire
    pub blocking_start: bool,
    /// Wait until the VPN is observed down on last release
    pub blocking_stop: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            lock_timeout: LockTimeout::Infinite,
            blocking_start: true,
            blocking_stop: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Acquire,
    Release,
}

/// Shared, reference-counted access to one named VPN connection
#[derive(Debug)]
pub struct ConnectionManager<C = Controller> {
    name: String,
    lock: FileLock,
    store: StateStore,
    controller: C,
    options: ManagerOptions,
}

impl ConnectionManager<Controller> {
    /// Build a manager for `name` from the configuration
    pub fn from_config(name: &str, config: &TunneledConfig) -> Result<Self> {
        Self::new(
            name,
            FileLock::new(&config.lock_path),
            StateStore::new(&config.state_path),
            Controller::from_config(config)?,
            ManagerOptions {
                lock_timeout: config.lock_timeout()?,
                blocking_start: config.blocking_start,
                blocking_stop: config.blocking_stop,
            },
        )
    }
}

impl<C: ResourceController> ConnectionManager<C> {
    /// Create a manager for connection `name`
    ///
    /// The name ends up in file system paths, so it is restricted to ASCII
    /// letters, digits, `-`, `_` and non-leading dots.
    pub fn new(
        name: impl Into<String>,
        lock: FileLock,
        store: StateStore,
        controller: C,
        options: ManagerOptions,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            lock,
            store,
            controller,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> &FileLock {
        &self.lock
    }

    /// Register one more user of the connection, starting it if needed
    ///
    /// Returns `Ok(false)` if the lock could not be taken within the
    /// configured timeout; nothing was changed in that case.
    pub fn acquire(&self) -> Result<bool> {
        self.locked(Direction::Acquire)
    }

    /// Unregister one user of the connection, stopping it if it was the last
    ///
    /// Returns `Ok(false)` if the lock could not be taken within the
    /// configured timeout; nothing was changed in that case.
    pub fn release(&self) -> Result<bool> {
        self.locked(Direction::Release)
    }

    /// Acquire and hand out a guard that releases when done
    ///
    /// `Ok(None)` means the lock timed out.
    pub fn connect(&self) -> Result<Option<Connection<'_, C>>> {
        if !self.acquire()? {
            return Ok(None);
        }
        Ok(Some(Connection {
            manager: self,
            released: false,
        }))
    }

    /// Read all persisted records under the lock
    pub fn records(&self) -> Result<Option<PersistedState>> {
        read_records(&self.lock, &self.store, self.options.lock_timeout)
    }

    fn locked(&self, direction: Direction) -> Result<bool> {
        let Some(guard) = self.lock.acquire(true, self.options.lock_timeout)? else {
            warn!(
                "Timed out after {} waiting for lock {}",
                self.options.lock_timeout,
                self.lock.path().display()
            );
            return Ok(false);
        };

        let updated = self.update(direction);
        finish(guard, updated).map(|_| true)
    }

    /// The critical section; the caller holds the lock
    fn update(&self, direction: Direction) -> Result<()> {
        let name = self.name.as_str();
        let mut state = as_real_user(|| self.store.load().map_err(TunneledError::from))?;
        let record = state.record_mut(name);
        debug!(
            "{:?} of {}: use count {}",
            direction, name, record.use_count
        );

        match direction {
            Direction::Acquire => {
                let use_count = record
                    .use_count
                    .checked_add(1)
                    .ok_or_else(|| ManagerError::UseCountOverflow {
                        name: name.to_string(),
                    })?;

                if record.use_count == 0 {
                    with_real_elevated(|| -> Result<()> {
                        if self.controller.is_in_state(name, record, ResourceState::Down)? {
                            info!("Starting connection {}", name);
                            self.controller.transition(
                                name,
                                record,
                                ResourceState::Up,
                                self.options.blocking_start,
                            )?;
                        }
                        Ok(())
                    })?;
                }

                record.use_count = use_count;
            }
            Direction::Release => {
                if record.use_count == 0 {
                    return Err(ManagerError::UseCountUnderflow {
                        name: name.to_string(),
                    }
                    .into());
                }

                if record.use_count <= 1 {
                    with_real_elevated(|| -> Result<()> {
                        if self.controller.is_in_state(name, record, ResourceState::Up)? {
                            info!("Stopping connection {}", name);
                            self.controller.transition(
                                name,
                                record,
                                ResourceState::Down,
                                self.options.blocking_stop,
                            )?;
                        }
                        Ok(())
                    })?;
                }

                record.use_count -= 1;
            }
        }

        let use_count = record.use_count;
        as_real_user(|| self.store.save(&state).map_err(TunneledError::from))?;
        debug!("Connection {} now has use count {}", name, use_count);
        Ok(())
    }
}

/// Snapshot of every connection record, read while holding `lock`
///
/// `Ok(None)` means the lock timed out.
pub fn read_records(
    lock: &FileLock,
    store: &StateStore,
    timeout: LockTimeout,
) -> Result<Option<PersistedState>> {
    let Some(guard) = lock.acquire(true, timeout)? else {
        return Ok(None);
    };
    let loaded = as_real_user(|| store.load().map_err(TunneledError::from));
    finish(guard, loaded).map(Some)
}

/// Release the lock after a critical section
///
/// A failed lock release outranks the section's own error: the lock may no
/// longer protect anyone.
fn finish<T>(guard: LockGuard, result: Result<T>) -> Result<T> {
    match guard.release() {
        Ok(()) => result,
        Err(release_error) => {
            if let Err(e) = &result {
                error!("Discarding error after failed lock release: {}", e);
            }
            Err(release_error.into())
        }
    }
}

fn validate_name(name: &str) -> std::result::Result<(), ManagerError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(ManagerError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// A held use of a connection
///
/// Call [`Connection::disconnect`] to release and see errors. Dropping the
/// guard releases too, logging any failure.
#[must_use = "the connection is released as soon as the guard is dropped"]
pub struct Connection<'a, C: ResourceController> {
    manager: &'a ConnectionManager<C>,
    released: bool,
}

impl<C: ResourceController> Connection<'_, C> {
    pub fn name(&self) -> &str {
        self.manager.name()
    }

    /// Release this use of the connection
    pub fn disconnect(mut self) -> Result<()> {
        self.released = true;
        if self.manager.release()? {
            Ok(())
        } else {
            Err(ManagerError::LockTimedOut {
                path: self.manager.lock.path().to_path_buf(),
            }
            .into())
        }
    }
}

impl<C: ResourceController> Drop for Connection<'_, C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match self.manager.release() {
            Ok(true) => {}
            Ok(false) => error!(
                "Could not release connection {}: lock timed out",
                self.manager.name
            ),
            Err(e) => error!("Could not release connection {}: {}", self.manager.name, e),
        }
    }
}
