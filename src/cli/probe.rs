//! `relink probe`: one-shot check of the reconnection preconditions

use super::build_probe;
use colored::Colorize;
use relink_core::config::toml_config::load_config;
use relink_core::error::RelinkError;
use relink_core::vpn::is_interface_up;
use std::path::Path;

pub fn run_probe(config_path: Option<&Path>) -> Result<(), RelinkError> {
    let config = load_config(config_path)?;
    let probe = build_probe(config.network.probe)?;

    println!(
        "Probe at {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );

    let reachable = probe.is_network_reachable();
    println!(
        "  network ({:?}): {}",
        config.network.probe,
        status(reachable, "reachable", "unreachable")
    );

    let interface_up = is_interface_up(&config.tunnel.interface);
    println!(
        "  tunnel ({}): {}",
        config.tunnel.interface,
        status(interface_up, "up", "down")
    );

    Ok(())
}

fn status(ok: bool, good: &str, bad: &str) -> String {
    if ok {
        good.green().to_string()
    } else {
        bad.red().to_string()
    }
}
