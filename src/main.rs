//! tunneled - run a program with its traffic tunneled over a shared VPN
//!
//! Several `tunneled` invocations may ask for the same VPN. The connection
//! is started by the first and stopped by the last; each program is placed
//! in the VPN's net_cls control group before it is executed.

use clap::{Parser, Subcommand};
use tunneled_core::error::{LockError, ManagerError, TunneledError};
use tunneled_core::init_logging;
use tunneled_core::privilege::drop_sudo_to_suid;

mod cli;
mod workload;

#[derive(Parser)]
#[command(name = "tunneled")]
#[command(about = "Tunnel a program's network traffic over VPN")]
#[command(version)]
struct Cli {
    /// Seconds to wait for the shared lock, -1 for no limit
    #[arg(long, global = true, allow_negative_numbers = true, value_name = "SECS")]
    lock_timeout: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program over a VPN connection
    Run {
        /// Program to tunnel
        program: String,
        /// VPN connection to tunnel over
        vpn: String,
        /// Arguments passed to the program
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Show the use count of every known connection
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a stale lock marker left behind by a crashed process
    ClearLock,
}

fn main() {
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();

    // Under sudo, become the invoking user with root kept as effective uid
    let result = drop_sudo_to_suid()
        .map_err(TunneledError::from)
        .and_then(|_| match cli.command {
            Commands::Run { program, vpn, args } => {
                cli::run::run_program(&program, &vpn, &args, cli.lock_timeout)
            }
            Commands::Status { json } => cli::status::run_status(cli.lock_timeout, json).map(|()| 0),
            Commands::ClearLock => cli::clear_lock::run_clear_lock().map(|()| 0),
        });

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let exit_code = match e {
                // Configuration and validation errors (exit code 2)
                TunneledError::Config(_) | TunneledError::Toml(_) => 2,
                TunneledError::Lock(LockError::InvalidTimeout { .. }) => 2,
                TunneledError::Manager(ManagerError::InvalidName { .. }) => 2,
                // Everything else happened at runtime (exit code 1)
                TunneledError::Lock(_)
                | TunneledError::State(_)
                | TunneledError::Identity(_)
                | TunneledError::Controller(_)
                | TunneledError::Manager(_)
                | TunneledError::Workload(_)
                | TunneledError::Io(_) => 1,
            };

            eprintln!("{}", e);
            std::process::exit(exit_code);
        }
    }
}

