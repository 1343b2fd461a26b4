//! Clear-lock command - recover from a crashed lock holder

use colored::Colorize;
use tunneled_core::error::TunneledError;
use tunneled_core::lock::clear_lock;

use super::load_effective_config;

/// Remove the configured lock marker
///
/// Only safe when no `tunneled` process is inside its critical section.
pub fn run_clear_lock() -> Result<(), TunneledError> {
    let config = load_effective_config(None)?;

    if clear_lock(&config.lock_path)? {
        println!(
            "{} Removed lock {}",
            "✓".green().bold(),
            config.lock_path.display()
        );
    } else {
        println!(
            "{} No lock at {}",
            "→".cyan(),
            config.lock_path.display()
        );
    }
    Ok(())
}
