//! `relink check-config`: validate and print the effective configuration

use colored::Colorize;
use relink_core::config::toml_config::{get_config_path, load_config};
use relink_core::error::RelinkError;
use std::path::Path;

/// Attempts whose backoff window is printed
const PREVIEW_ATTEMPTS: u32 = 6;

pub fn run_check_config(config_path: Option<&Path>) -> Result<(), RelinkError> {
    let source = match config_path {
        Some(path) => path.display().to_string(),
        None => {
            let default_path = get_config_path()?;
            if default_path.exists() {
                default_path.display().to_string()
            } else {
                format!("defaults ({} not found)", default_path.display())
            }
        }
    };

    let config = load_config(config_path)?;

    println!("{} {}", "✓".green().bold(), "Configuration is valid".bold());
    println!("  source: {}", source);
    println!();

    println!("{}", "Scheduler".bold());
    println!(
        "  check interval:   {}s",
        config.scheduler.check_interval_secs
    );
    println!();

    println!("{}", "Backoff".bold());
    println!(
        "  base:             {} (jitter {}..{})",
        config.backoff.base, config.backoff.jitter_min, config.backoff.jitter_max
    );
    println!("  recheck delay:    {}ms", config.backoff.recheck_delay_ms);
    match config.backoff.max_delay_secs {
        Some(max) => println!("  max delay:        {}s", max),
        None => println!("  max delay:        {}", "unbounded".yellow()),
    }
    for attempt in 0..PREVIEW_ATTEMPTS {
        let (low, high) = config.backoff.delay_window(attempt);
        println!(
            "  attempt #{}:       {:.2}s - {:.2}s",
            attempt,
            low.as_secs_f64(),
            high.as_secs_f64()
        );
    }
    println!();

    println!("{}", "Monitors".bold());
    println!(
        "  network probe:    {:?} every {}ms",
        config.network.probe, config.network.poll_interval_ms
    );
    println!(
        "  session backend:  {:?} (assume unlocked: {})",
        config.session.backend, config.session.assume_unlocked
    );
    println!();

    println!("{}", "Tunnel".bold());
    println!(
        "  interface:        {} (polled every {}ms)",
        config.tunnel.interface, config.tunnel.poll_interval_ms
    );
    match &config.tunnel.reconnect_command {
        Some(command) => println!("  reconnect with:   {}", command),
        None => println!(
            "  reconnect with:   {}",
            "nothing configured, attempts are only logged".yellow()
        ),
    }

    Ok(())
}
