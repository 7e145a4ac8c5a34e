//! relink - automatic VPN reconnection daemon
//!
//! Watches a VPN tunnel interface and re-establishes the tunnel with
//! exponential backoff once it drops, waiting for the network to come back
//! and for the user session to be unlocked.

use clap::{Parser, Subcommand};
use relink_core::{error::RelinkError, init_logging};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "relink")]
#[command(version, about = "Automatic VPN reconnection with suspend-aware backoff")]
struct Cli {
    /// Configuration file (defaults to ~/.config/relink/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the tunnel and reconnect it whenever it drops
    Run,
    /// Validate the configuration and print the effective settings
    CheckConfig,
    /// Check network reachability and the tunnel interface once
    Probe,
}

fn main() {
    // Initialize logging
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Run => cli::run::run_daemon(config_path),
        Commands::CheckConfig => cli::check_config::run_check_config(config_path),
        Commands::Probe => cli::probe::run_probe(config_path),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            let exit_code = match e {
                // Configuration errors (exit code 2)
                RelinkError::Config(_) | RelinkError::Toml(_) | RelinkError::TomlSerialize(_) => 2,
                // Everything else happens at runtime (exit code 1)
                RelinkError::Scheduler(_)
                | RelinkError::Coordinator(_)
                | RelinkError::Monitor(_)
                | RelinkError::Task(_)
                | RelinkError::Io(_) => 1,
            };

            eprintln!("{}", e);
            std::process::exit(exit_code);
        }
    }
}
