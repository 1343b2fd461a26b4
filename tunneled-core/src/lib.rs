//! Core library for the tunneled VPN wrapper
//!
//! This crate provides the cross-process pieces that let unrelated
//! invocations of `tunneled` share one VPN connection: a filesystem lock,
//! the persisted use-count state, identity brackets for privileged steps,
//! the VPN backends and the reference-counting manager tying them together.

pub mod error;

pub mod config;
pub mod controller;
pub mod lock;
pub mod manager;
pub mod privilege;
pub mod state;

/// Environment variable holding the log filter directive
pub const LOG_ENV: &str = "TUNNELED_LOG";

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging when running under systemd.
/// Otherwise logs to stderr, filtered through `TUNNELED_LOG` (default `warn`)
/// so the wrapped program's terminal stays quiet.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(tracing_subscriber::filter::LevelFilter::INFO)
                .init();
            return Ok(());
        }
    }

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}
