//! CLI command implementations
//!
//! This module contains the implementation of all CLI subcommands.

pub mod clear_lock;
pub mod run;
pub mod status;

use tunneled_core::config::toml_config::load_config;
use tunneled_core::config::TunneledConfig;
use tunneled_core::error::{ConfigError, TunneledError};

/// Load the configuration and apply the `--lock-timeout` override
pub(crate) fn load_effective_config(
    lock_timeout: Option<f64>,
) -> Result<TunneledConfig, TunneledError> {
    let mut config = load_config()?;

    if let Some(secs) = lock_timeout {
        config.lock_timeout_secs = secs;
        config
            .validate()
            .map_err(|message| ConfigError::ValidationError { message })?;
    }

    Ok(config)
}
