//! pulse-hook: thin client between the assistant CLI and the Pulse daemon.
//!
//! Configured as the hook command in ~/.claude/settings.json. Reads one
//! hook envelope from stdin, forwards it over the daemon socket and prints
//! the reply. When the daemon is unreachable the dashboard is simply off:
//! the client prints `{"continue": true}` itself and exits 0, so the
//! assistant is never blocked.
//!
//! ## Subcommands
//!
//! - `handle`: forward one hook event (reads JSON from stdin)
//! - `setup`: install the hook entries into ~/.claude/settings.json

mod client;
mod setup;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pulse-hook")]
#[command(about = "Pulse hook forwarder")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a hook event (reads JSON from stdin)
    Handle,

    /// Install Pulse hooks into Claude Code settings
    Setup,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Handle => client::run(),
        Commands::Setup => {
            if let Err(err) = setup::run(None) {
                eprintln!("pulse-hook setup failed: {err}");
                std::process::exit(1);
            }
        }
    }
}

fn init_logging() {
    // Diagnostics go to stderr; stdout is reserved for the hook protocol.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
