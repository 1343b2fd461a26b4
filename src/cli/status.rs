//! Status command - show the use count of every connection

use colored::Colorize;
use serde_json::json;
use tracing::debug;
use tunneled_core::controller::{Controller, ResourceController, ResourceState};
use tunneled_core::error::{ManagerError, TunneledError};
use tunneled_core::lock::FileLock;
use tunneled_core::manager::read_records;
use tunneled_core::state::{ConnectionRecord, PersistedState, StateStore};

use super::load_effective_config;

/// Print every persisted connection record
///
/// The records are read under the shared lock so a half-written state is
/// never shown. Whether a connection is really up is asked from the
/// configured backend; if it cannot be built the column reads "unknown".
pub fn run_status(lock_timeout: Option<f64>, as_json: bool) -> Result<(), TunneledError> {
    let config = load_effective_config(lock_timeout)?;
    let lock = FileLock::new(&config.lock_path);
    let store = StateStore::new(&config.state_path);

    let state = read_records(&lock, &store, config.lock_timeout()?)?.ok_or_else(|| {
        ManagerError::LockTimedOut {
            path: config.lock_path.clone(),
        }
    })?;

    let controller = match Controller::from_config(&config) {
        Ok(controller) => Some(controller),
        Err(e) => {
            debug!("Backend unavailable, not probing connections: {}", e);
            None
        }
    };

    if as_json {
        render_json(&state, controller.as_ref())?;
    } else {
        render_human(&state, controller.as_ref());
    }
    Ok(())
}

fn probe(controller: Option<&Controller>, name: &str, record: &ConnectionRecord) -> Option<bool> {
    controller?
        .is_in_state(name, record, ResourceState::Up)
        .map_err(|e| debug!("Could not probe {}: {}", name, e))
        .ok()
}

fn render_json(state: &PersistedState, controller: Option<&Controller>) -> Result<(), TunneledError> {
    let connections: Vec<_> = state
        .iter()
        .map(|(name, record)| {
            json!({
                "name": name,
                "pid": record.pid,
                "use_count": record.use_count,
                "up": probe(controller, name, record),
            })
        })
        .collect();

    let output = serde_json::to_string_pretty(&json!({ "connections": connections }))
        .map_err(|e| TunneledError::Io(e.into()))?;
    println!("{}", output);
    Ok(())
}

fn render_human(state: &PersistedState, controller: Option<&Controller>) {
    if state.is_empty() {
        println!("{} No connections recorded", "→".cyan());
        return;
    }

    for (name, record) in state.iter() {
        let running = match probe(controller, name, record) {
            Some(true) => "up".green().bold(),
            Some(false) => "down".red().bold(),
            None => "unknown".yellow(),
        };
        let pid = record
            .pid
            .map(|pid| format!(" (pid {})", pid))
            .unwrap_or_default();

        println!(
            "{} {} used by {}{}",
            running,
            name.bold(),
            record.use_count,
            pid
        );
    }
}
