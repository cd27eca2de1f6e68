//! Pulse daemon entrypoint.
//!
//! One binary, three roles:
//!
//! - `serve` (default): the long-lived single-instance intake daemon on
//!   the Unix socket
//! - `reconcile <session_id> <timestamp>`: one debounced reconciliation
//!   worker, spawned detached by the daemon per hook
//! - `sweep`: one maintenance pass, spawned for every non-SessionStart
//!   hook and also runnable standalone
//!
//! Workers run as subprocesses of this same executable so coordination
//! state (markers, locks, the store) survives daemon restarts unchanged.

mod intake;
mod server;

use clap::{Parser, Subcommand};
use pulse_core::{reconcile, sweep, Config};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pulse-daemon")]
#[command(about = "Pulse session-telemetry intake daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the intake daemon (default)
    Serve,

    /// Run one debounced reconciliation worker for a session
    Reconcile {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        /// RFC 3339 timestamp of the hook event that spawned this worker
        #[arg(value_name = "TIMESTAMP")]
        timestamp: String,
    },

    /// Run one maintenance sweep
    Sweep,
}

fn main() {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "Failed to resolve configuration");
            std::process::exit(1);
        }
    };

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            if let Err(err) = server::run(&config) {
                tracing::error!(error = %err, "Daemon failed");
                std::process::exit(1);
            }
        }
        Commands::Reconcile {
            session_id,
            timestamp,
        } => {
            if let Err(err) = reconcile::run(&config, &session_id, &timestamp) {
                tracing::error!(error = %err, session_id = %session_id, "Reconciler failed");
                std::process::exit(1);
            }
        }
        Commands::Sweep => {
            if let Err(err) = sweep::run(&config) {
                tracing::error!(error = %err, "Sweep failed");
                std::process::exit(1);
            }
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
