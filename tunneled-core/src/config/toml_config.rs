//! TOML configuration file I/O
//!
//! Loads the configuration from the invoking user's configuration
//! directory, `~/.tunneled`, which also holds the OpenVPN `.conf` files.

use std::path::{Path, PathBuf};

use nix::unistd::User;
use tracing::debug;

use crate::config::TunneledConfig;
use crate::error::{ConfigError, TunneledError};

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "TUNNELED_CONFIG_DIR";

/// Get the configuration directory
///
/// Returns `$TUNNELED_CONFIG_DIR` if set. Otherwise `~/.tunneled` of the
/// user who invoked us: under `sudo` that is `SUDO_USER`'s home from the
/// password database, not root's.
pub fn get_config_dir() -> Result<PathBuf, TunneledError> {
    if let Ok(config_dir) = std::env::var(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(config_dir));
    }

    let home = if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        User::from_name(&sudo_user)
            .ok()
            .flatten()
            .map(|user| user.dir)
            .ok_or_else(|| {
                TunneledError::Config(ConfigError::IoError {
                    message: format!("Failed to determine home directory for user: {}", sudo_user),
                })
            })?
    } else {
        std::env::var("HOME").map(PathBuf::from).map_err(|_| {
            TunneledError::Config(ConfigError::IoError {
                message: "HOME environment variable not set".to_string(),
            })
        })?
    };

    Ok(home.join(".tunneled"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, TunneledError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the configuration from the default file
///
/// A missing file yields the defaults.
pub fn load_config() -> Result<TunneledConfig, TunneledError> {
    let path = get_config_path()?;
    if !path.exists() {
        debug!("No configuration at {}, using defaults", path.display());
        return Ok(TunneledConfig::default());
    }
    load_config_from_path(&path)
}

/// Load the configuration from a specific TOML file
pub fn load_config_from_path<P: AsRef<Path>>(path: P) -> Result<TunneledConfig, TunneledError> {
    let contents = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TunneledError::Config(ConfigError::LoadFailed {
            path: path.as_ref().to_string_lossy().to_string(),
        }),
        _ => TunneledError::Config(ConfigError::IoError {
            message: format!("Failed to read config file: {}", e),
        }),
    })?;

    let config: TunneledConfig = toml::from_str(&contents)?;

    config
        .validate()
        .map_err(|e| TunneledError::Config(ConfigError::ValidationError { message: e }))?;

    debug!("Loaded configuration from {}", path.as_ref().display());
    Ok(config)
}
