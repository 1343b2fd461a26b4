use std::time::Duration;

use crate::error::LockError;

/// How long a blocking acquire may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeout {
    /// Wait until the lock becomes free
    #[default]
    Infinite,
    /// Give up after this long
    Bounded(Duration),
}

impl LockTimeout {
    /// Build a timeout from seconds, where `-1` means infinite
    ///
    /// Every other negative value, NaN, and anything too large for a
    /// [`Duration`] is rejected.
    pub fn from_secs_f64(secs: f64) -> Result<Self, LockError> {
        if secs == -1.0 {
            return Ok(Self::Infinite);
        }
        Duration::try_from_secs_f64(secs)
            .map(Self::Bounded)
            .map_err(|_| LockError::InvalidTimeout { value: secs })
    }

    pub(super) fn budget(self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::Bounded(d) => Some(d),
        }
    }
}

impl TryFrom<f64> for LockTimeout {
    type Error = LockError;

    fn try_from(secs: f64) -> Result<Self, Self::Error> {
        Self::from_secs_f64(secs)
    }
}

impl std::fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockTimeout::Infinite => write!(f, "infinite"),
            LockTimeout::Bounded(d) => write!(f, "{:.3}s", d.as_secs_f64()),
        }
    }
}
