//! Persisted connection state
//!
//! A small JSON file mapping each connection name to its use count and,
//! for the direct-process backend, the pid of the running OpenVPN:
//!
//! ```json
//! {"work.vpn-a": {"pid": 4242, "use_count": 2}}
//! ```
//!
//! The file has no locking of its own. Every load → mutate → save cycle must
//! happen while the caller holds the [`FileLock`](crate::lock::FileLock) for
//! the same state file; nothing in this module checks that.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StateError;

/// Default state file path
pub const DEFAULT_STATE_PATH: &str = "/tmp/.tunneled-state";

/// Persisted bookkeeping for one named connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Pid of the OpenVPN process we started, if any
    #[serde(default)]
    pub pid: Option<i32>,

    /// Number of live holders of this connection
    pub use_count: u32,
}

/// All connection records, keyed by connection name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistedState(BTreeMap<String, ConnectionRecord>);

impl PersistedState {
    /// Look up a record without creating it
    pub fn record(&self, name: &str) -> Option<&ConnectionRecord> {
        self.0.get(name)
    }

    /// Look up a record, creating a zeroed one on first use
    pub fn record_mut(&mut self, name: &str) -> &mut ConnectionRecord {
        self.0.entry(name.to_string()).or_default()
    }

    /// Iterate over all records in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConnectionRecord)> {
        self.0.iter().map(|(name, record)| (name.as_str(), record))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Whole-file load/save of [`PersistedState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the state file
    ///
    /// A missing file is an empty state. Content that does not parse is
    /// refused with [`StateError::Corrupt`]: guessing would risk starting a
    /// second tunnel or stopping one still in use.
    pub fn load(&self) -> Result<PersistedState, StateError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state file at {}, starting empty", self.path.display());
                return Ok(PersistedState::default());
            }
            Err(e) => {
                return Err(StateError::ReadFailed {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        serde_json::from_str(&contents).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Overwrite the state file with `state`
    pub fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let contents = serde_json::to_string(state).map_err(StateError::Serialize)?;

        fs::write(&self.path, contents).map_err(|e| StateError::WriteFailed {
            path: self.path.clone(),
            source: e,
        })?;

        debug!(
            "Saved {} connection record(s) to {}",
            state.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));

        let state = store.load().unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_record_mut_creates_default_record() {
        let mut state = PersistedState::default();

        let record = state.record_mut("vpn-a");
        assert_eq!(record.use_count, 0);
        assert_eq!(record.pid, None);

        assert_eq!(state.len(), 1);
        assert!(state.record("vpn-b").is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));

        let mut state = PersistedState::default();
        *state.record_mut("vpn-a") = ConnectionRecord {
            pid: Some(4242),
            use_count: 2,
        };
        state.record_mut("vpn-b").use_count = 1;
        store.save(&state).unwrap();

        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn test_save_of_loaded_state_leaves_content_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let original = r#"{"a.vpn":{"pid":null,"use_count":0},"b.vpn":{"pid":17,"use_count":3}}"#;
        fs::write(&path, original).unwrap();

        let store = StateStore::new(&path);
        let state = store.load().unwrap();
        store.save(&state).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_record_without_pid_field_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, r#"{"vpn-a":{"use_count":1}}"#).unwrap();

        let state = StateStore::new(&path).load().unwrap();
        assert_eq!(
            state.record("vpn-a"),
            Some(&ConnectionRecord {
                pid: None,
                use_count: 1
            })
        );
    }

    #[test]
    fn test_corrupt_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, "{\"vpn-a\": {\"use_count\": ").unwrap();

        let err = StateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[test]
    fn test_negative_use_count_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, r#"{"vpn-a":{"pid":null,"use_count":-1}}"#).unwrap();

        let err = StateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[test]
    fn test_save_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nope").join("state"));

        let err = store.save(&PersistedState::default()).unwrap_err();
        assert!(matches!(err, StateError::WriteFailed { .. }));
    }
}
