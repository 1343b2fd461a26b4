//! Error types for the tunneled VPN wrapper
//!
//! Each concern gets its own error enum so callers can tell a broken lock
//! from a failed VPN transition. `TunneledError` wraps them all.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the tunneled application
#[derive(Error, Debug)]
pub enum TunneledError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors from the cross-process lock
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Errors reading or writing the persisted connection state
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Errors while changing process identity
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Errors from the VPN backend
    #[error("VPN error: {0}")]
    Controller(#[from] ControllerError),

    /// Errors from the reference-counting manager itself
    #[error("Connection error: {0}")]
    Manager(#[from] ManagerError),

    /// Errors running the tunneled program
    #[error("Program error: {0}")]
    Workload(#[from] WorkloadError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Cross-process lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Timeout was negative without being the infinite marker
    #[error("Invalid lock timeout {value}: must be non-negative and finite, or -1 for infinite")]
    InvalidTimeout { value: f64 },

    #[error("Failed to create lock marker {path}: {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for lock marker {path}: {source}")]
    WaitFailed {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// The marker could not be removed; mutual exclusion may already be broken
    #[error("Could not release lock {path}: {source}")]
    ReleaseFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Persisted state errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read state file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Real/effective/saved identity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Could not read process identity: {0}")]
    ReadFailed(nix::Error),

    #[error("Could not set process identity: {0}")]
    SetFailed(nix::Error),

    #[error("Could not properly drop {kind} id: expected {expected}, got {actual}")]
    Mismatch {
        kind: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Sudo user {user} not found in password database")]
    UnknownUser { user: String },

    #[error("tunneled must be run as root (effective and saved user id 0)")]
    NotPrivileged,
}

/// VPN backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Could not find executable {name}: {reason}")]
    BinaryNotFound { name: String, reason: String },

    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Could not change state of {name} to {target}: {reason}")]
    TransitionFailed {
        name: String,
        target: String,
        reason: String,
    },

    #[error("Unexpected status exit code {code:?} for {name}")]
    UnexpectedStatus { name: String, code: Option<i32> },

    #[error("{name} did not reach state {target} within {seconds} seconds")]
    Timeout {
        name: String,
        target: String,
        seconds: u64,
    },

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: i32, reason: String },
}

/// Reference-counting invariant violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// More releases than acquires were recorded for this connection
    #[error("Connection {name} released more often than acquired (use count is already 0)")]
    UseCountUnderflow { name: String },

    #[error("Use count of connection {name} overflowed")]
    UseCountOverflow { name: String },

    #[error("Invalid connection name {name:?}: use letters, digits, '-', '_' and non-leading '.'")]
    InvalidName { name: String },

    #[error("Timed out waiting for lock {path}")]
    LockTimedOut { path: PathBuf },
}

/// Errors preparing, running or supervising the tunneled program
#[derive(Error, Debug)]
pub enum WorkloadError {
    /// The per-connection control group is missing or not writable
    #[error("Cannot join control group {path}: {source}")]
    CgroupUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for {program}: {source}")]
    WaitFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set up supervision of the program: {0}")]
    Supervise(#[source] std::io::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TunneledError>;
