//! Real/effective/saved identity handling
//!
//! `tunneled` runs setuid root (or under `sudo`, which [`drop_sudo_to_suid`]
//! turns into the same shape): the real ids belong to the invoking user while
//! the effective and saved uid stay root. Privileged steps are bracketed:
//!
//! 1. raise the real uid to the effective uid, since OpenVPN and the service
//!    manager check the real uid;
//! 2. do the privileged work;
//! 3. put the entry identity back and verify it.
//!
//! Step 3 runs on every exit path. [`PrivilegeGuard`] restores in `Drop`, and
//! the closure brackets restore before handing back the body's error.

use std::fmt;

use nix::unistd::{getresgid, getresuid, setresgid, setresuid, Gid, Uid, User};
use tracing::{debug, error};

use crate::error::IdentityError;

/// One (real, effective, saved) id triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdTriple<T> {
    pub real: T,
    pub effective: T,
    pub saved: T,
}

impl<T: Copy> IdTriple<T> {
    /// All three ids set to `id`
    pub fn uniform(id: T) -> Self {
        Self {
            real: id,
            effective: id,
            saved: id,
        }
    }
}

impl<T: fmt::Display> fmt::Display for IdTriple<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.real, self.effective, self.saved)
    }
}

/// Full user and group identity of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: IdTriple<Uid>,
    pub gid: IdTriple<Gid>,
}

impl Identity {
    /// Read the current identity from the kernel
    pub fn current() -> Result<Self, IdentityError> {
        Ok(Self {
            uid: current_uids()?,
            gid: current_gids()?,
        })
    }

    /// Make this the process identity, verifying the result
    ///
    /// User ids go first so that a restore regains the privilege needed to
    /// set the group ids.
    pub fn apply(&self) -> Result<(), IdentityError> {
        set_uids(self.uid)?;
        set_gids(self.gid)
    }
}

fn current_uids() -> Result<IdTriple<Uid>, IdentityError> {
    let ids = getresuid().map_err(IdentityError::ReadFailed)?;
    Ok(IdTriple {
        real: ids.real,
        effective: ids.effective,
        saved: ids.saved,
    })
}

fn current_gids() -> Result<IdTriple<Gid>, IdentityError> {
    let ids = getresgid().map_err(IdentityError::ReadFailed)?;
    Ok(IdTriple {
        real: ids.real,
        effective: ids.effective,
        saved: ids.saved,
    })
}

fn set_uids(target: IdTriple<Uid>) -> Result<(), IdentityError> {
    setresuid(target.real, target.effective, target.saved).map_err(IdentityError::SetFailed)?;

    let actual = current_uids()?;
    if actual != target {
        return Err(IdentityError::Mismatch {
            kind: "user",
            expected: target.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn set_gids(target: IdTriple<Gid>) -> Result<(), IdentityError> {
    setresgid(target.real, target.effective, target.saved).map_err(IdentityError::SetFailed)?;

    let actual = current_gids()?;
    if actual != target {
        return Err(IdentityError::Mismatch {
            kind: "group",
            expected: target.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Temporary identity change that is undone when the guard goes away
#[derive(Debug)]
#[must_use = "the identity is restored as soon as the guard is dropped"]
pub struct PrivilegeGuard {
    entry: Identity,
    restored: bool,
}

impl PrivilegeGuard {
    /// Raise the real uid to the effective uid
    pub fn elevate_real() -> Result<Self, IdentityError> {
        let guard = Self::enter()?;
        let uid = guard.entry.uid;
        set_uids(IdTriple {
            real: uid.effective,
            ..uid
        })?;
        debug!("Elevated real uid {} to {}", uid.real, uid.effective);
        Ok(guard)
    }

    /// Lower the effective uid to the real uid, keeping the saved uid
    ///
    /// Files created inside this bracket belong to the invoking user.
    pub fn drop_to_real() -> Result<Self, IdentityError> {
        let guard = Self::enter()?;
        let uid = guard.entry.uid;
        set_uids(IdTriple {
            effective: uid.real,
            ..uid
        })?;
        debug!("Dropped effective uid {} to {}", uid.effective, uid.real);
        Ok(guard)
    }

    fn enter() -> Result<Self, IdentityError> {
        Ok(Self {
            entry: Identity::current()?,
            restored: false,
        })
    }

    /// Identity in effect when the guard was created
    pub fn entry(&self) -> &Identity {
        &self.entry
    }

    /// Put the entry identity back and verify it
    pub fn restore(mut self) -> Result<(), IdentityError> {
        self.restored = true;
        self.entry.apply()
    }
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }

        if let Err(e) = self.entry.apply() {
            // Carrying on with an unknown identity is worse than dying
            error!("Could not restore identity {:?}: {}", self.entry, e);
            std::process::abort();
        }
    }
}

/// Run `f` with the real uid raised to the effective uid
///
/// The entry identity is restored whether or not `f` succeeds. If restoring
/// fails, that error is returned instead of `f`'s result.
pub fn with_real_elevated<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<IdentityError>,
{
    bracket(PrivilegeGuard::elevate_real()?, f)
}

/// Run `f` with the effective uid lowered to the real uid
pub fn as_real_user<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<IdentityError>,
{
    bracket(PrivilegeGuard::drop_to_real()?, f)
}

fn bracket<T, E, F>(guard: PrivilegeGuard, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<IdentityError>,
{
    let result = f();
    guard.restore()?;
    result
}

/// Turn a `sudo` invocation into a setuid-style identity
///
/// If `SUDO_USER` is set, all group ids become that user's group, the real
/// uid becomes that user's uid, and the effective and saved uids keep the
/// current effective uid. Returns whether anything was changed.
pub fn drop_sudo_to_suid() -> Result<bool, IdentityError> {
    match std::env::var("SUDO_USER") {
        Ok(user) => {
            drop_to_user(&user)?;
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

/// Make `name` the real identity while keeping the effective uid
pub fn drop_to_user(name: &str) -> Result<(), IdentityError> {
    let user = User::from_name(name)
        .map_err(IdentityError::ReadFailed)?
        .ok_or_else(|| IdentityError::UnknownUser {
            user: name.to_string(),
        })?;

    set_gids(IdTriple::uniform(user.gid))?;

    let effective = current_uids()?.effective;
    set_uids(IdTriple {
        real: user.uid,
        effective,
        saved: effective,
    })?;

    debug!("Dropped sudo identity to user {} ({})", name, user.uid);
    Ok(())
}

/// Fail unless the effective and saved uids are root
pub fn require_privileged() -> Result<(), IdentityError> {
    let uid = current_uids()?;
    if uid.effective.is_root() && uid.saved.is_root() {
        Ok(())
    } else {
        Err(IdentityError::NotPrivileged)
    }
}

/// Set all uids to the real uid, giving up privilege for good
///
/// Only raw system calls and no allocation, so this is safe to call between
/// `fork` and `exec`. A failed verification is reported as `EPERM`.
pub fn drop_permanently() -> nix::Result<()> {
    let real = getresuid()?.real;
    setresuid(real, real, real)?;

    let ids = getresuid()?;
    if ids.real != real || ids.effective != real || ids.saved != real {
        return Err(nix::errno::Errno::EPERM);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::geteuid;

    #[test]
    fn test_current_identity_matches_kernel() {
        let identity = Identity::current().unwrap();
        assert_eq!(identity.uid.effective, geteuid());
    }

    #[test]
    fn test_apply_current_identity_is_a_no_op() {
        let before = Identity::current().unwrap();
        before.apply().unwrap();
        assert_eq!(Identity::current().unwrap(), before);
    }

    #[test]
    fn test_elevate_real_guard_restores_entry_identity() {
        let before = Identity::current().unwrap();

        let guard = PrivilegeGuard::elevate_real().unwrap();
        assert_eq!(guard.entry(), &before);
        let inside = Identity::current().unwrap();
        assert_eq!(inside.uid.real, before.uid.effective);
        guard.restore().unwrap();

        assert_eq!(Identity::current().unwrap(), before);
    }

    #[test]
    fn test_drop_to_real_guard_restores_on_drop() {
        let before = Identity::current().unwrap();

        {
            let _guard = PrivilegeGuard::drop_to_real().unwrap();
            assert_eq!(Identity::current().unwrap().uid.effective, before.uid.real);
        }

        assert_eq!(Identity::current().unwrap(), before);
    }

    #[test]
    fn test_bracket_returns_body_result() {
        let value: Result<u32, IdentityError> = with_real_elevated(|| Ok(7));
        assert_eq!(value.unwrap(), 7);
    }

    #[test]
    fn test_bracket_restores_identity_when_body_fails() {
        #[derive(Debug, PartialEq)]
        enum BodyError {
            Failed,
            Identity,
        }

        impl From<IdentityError> for BodyError {
            fn from(_: IdentityError) -> Self {
                BodyError::Identity
            }
        }

        let before = Identity::current().unwrap();
        let result: Result<(), BodyError> = as_real_user(|| Err(BodyError::Failed));

        assert_eq!(result.unwrap_err(), BodyError::Failed);
        assert_eq!(Identity::current().unwrap(), before);
    }

    #[test]
    fn test_drop_to_unknown_user_changes_nothing() {
        let before = Identity::current().unwrap();

        let err = drop_to_user("tunneled-no-such-user-for-tests").unwrap_err();

        assert!(matches!(err, IdentityError::UnknownUser { .. }));
        assert_eq!(Identity::current().unwrap(), before);
    }

    #[test]
    fn test_require_privileged_matches_effective_uid() {
        let uid = current_uids().unwrap();
        let expected = uid.effective.is_root() && uid.saved.is_root();
        assert_eq!(require_privileged().is_ok(), expected);
    }

    #[test]
    fn test_id_triple_display() {
        let triple = IdTriple {
            real: Uid::from_raw(1000),
            effective: Uid::from_raw(0),
            saved: Uid::from_raw(0),
        };
        assert_eq!(triple.to_string(), "(1000, 0, 0)");
    }
}
