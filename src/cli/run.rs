//! `relink run`: the reconnection daemon
//!
//! Wires the tunnel watcher, the monitors and the coordinator onto a single
//! event loop and runs until interrupted.

use super::build_probe;
use relink_core::config::toml_config::{load_config, RelinkConfig};
use relink_core::error::{ErrorSink, RelinkError, TracingErrorSink};
use relink_core::runtime::{EventLoop, SystemClock};
use relink_core::scheduler::Scheduler;
use relink_core::types::TunnelState;
use relink_core::vpn::{
    CommandConnector, InterfaceWatcher, Monitors, NetworkMonitor, ReachabilityProbe,
    ReconnectionCoordinator, SessionMonitor, TunnelConnector, TunnelStateBus, VpnMonitor,
};
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Connector used when no reconnect command is configured
///
/// Leaves reconnecting to whatever manages the VPN client (e.g. a systemd
/// unit with `Restart=`), but still logs when an attempt would be made.
struct LogOnlyConnector {
    interface: String,
}

impl TunnelConnector for LogOnlyConnector {
    fn reconnect(&self) {
        warn!(
            interface = %self.interface,
            "Reconnection attempt due but no reconnect_command is configured"
        );
    }
}

/// Load the configuration and run the daemon until SIGINT or SIGTERM
pub fn run_daemon(config_path: Option<&Path>) -> Result<(), RelinkError> {
    let config = load_config(config_path)?;
    let probe = build_probe(config.network.probe)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config, probe))
}

async fn serve(config: RelinkConfig, probe: Arc<dyn ReachabilityProbe>) -> Result<(), RelinkError> {
    let (event_loop, handle) = EventLoop::new();
    let error_sink: Arc<dyn ErrorSink> = Arc::new(TracingErrorSink);

    let scheduler = Scheduler::new(
        Arc::new(SystemClock),
        handle.clone(),
        error_sink.clone(),
        config.scheduler.check_interval(),
    );

    let bus = Arc::new(TunnelStateBus::new(TunnelState::Disconnected));
    let monitors = Monitors {
        vpn: VpnMonitor::new(bus.clone(), handle.clone()),
        network: NetworkMonitor::new(probe, handle.clone(), config.network.poll_interval()),
        session: SessionMonitor::new(config.session.clone(), handle),
    };

    let connector: Arc<dyn TunnelConnector> = match &config.tunnel.reconnect_command {
        Some(command) => Arc::new(CommandConnector::new(
            command.clone(),
            config.tunnel.interface.clone(),
            bus.clone(),
        )),
        None => Arc::new(LogOnlyConnector {
            interface: config.tunnel.interface.clone(),
        }),
    };

    let coordinator = ReconnectionCoordinator::new(
        scheduler.clone(),
        config.backoff.clone(),
        monitors,
        connector,
        error_sink,
    );

    // Nothing runs on the event loop yet, so enabling from here is safe
    scheduler.start()?;
    coordinator.enable()?;

    let watcher = InterfaceWatcher::new(
        config.tunnel.interface.clone(),
        bus,
        config.tunnel.poll_interval(),
    )
    .spawn();

    info!(
        interface = %config.tunnel.interface,
        started_at = %chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "relink is watching the tunnel"
    );

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = event_loop.run() => warn!("Event loop stopped unexpectedly"),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, shutting down");
        }
        _ = terminate.recv() => info!("Terminated, shutting down"),
    }

    watcher.abort();
    coordinator.disable();
    scheduler.stop();
    Ok(())
}
