//! Run command - tunnel one program over a shared VPN connection

use tracing::{debug, error};
use tunneled_core::error::{ManagerError, TunneledError};
use tunneled_core::manager::ConnectionManager;
use tunneled_core::privilege::require_privileged;

use super::load_effective_config;
use crate::workload;

/// Run `program` over connection `vpn` and return its exit code
///
/// The connection is acquired before the program starts and released after
/// it exits, whatever the exit status. The control group is opened first so
/// a missing group fails before the VPN is touched.
pub fn run_program(
    program: &str,
    vpn: &str,
    args: &[String],
    lock_timeout: Option<f64>,
) -> Result<i32, TunneledError> {
    let config = load_effective_config(lock_timeout)?;
    require_privileged()?;

    let manager = ConnectionManager::from_config(vpn, &config)?;
    let tasks = workload::open_tasks(&workload::tasks_path(&config.cgroup_root, vpn))?;

    let Some(connection) = manager.connect()? else {
        return Err(ManagerError::LockTimedOut {
            path: config.lock_path.clone(),
        }
        .into());
    };
    debug!("Acquired connection {}", connection.name());

    let outcome = workload::run(program, args, tasks);

    if let Err(e) = connection.disconnect() {
        if let Err(workload_error) = &outcome {
            error!("Discarding program error after failed release: {}", workload_error);
        }
        return Err(e);
    }

    Ok(outcome?)
}
