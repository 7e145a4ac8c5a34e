//! Network connectivity monitoring
//!
//! This module provides NetworkMonitor, which polls a reachability probe off
//! the event loop and calls its callback whenever connectivity comes up.

use crate::error::MonitorError;
use crate::runtime::{lock, Callback, EventLoopHandle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Address reserved for documentation (RFC 5737): never in use, but only
/// routable when the machine has a default route.
const PROBE_ADDRESS: &str = "192.0.2.1";

/// NM_STATE_CONNECTED_GLOBAL
const NM_STATE_CONNECTED_GLOBAL: u32 = 70;

/// Answers "can this machine reach the network right now?"
///
/// Implementations may block; the monitor calls them on a blocking thread.
pub trait ReachabilityProbe: Send + Sync {
    fn is_network_reachable(&self) -> bool;
}

/// Checks for a route to [`PROBE_ADDRESS`] with `ip route get`
#[derive(Debug, Clone)]
pub struct IpRouteProbe {
    ip_binary: PathBuf,
}

impl IpRouteProbe {
    pub fn new() -> Result<Self, MonitorError> {
        let ip_binary = which::which("ip").map_err(|e| MonitorError::ProbeUnavailable {
            reason: format!("`ip` not found: {}", e),
        })?;
        Ok(Self { ip_binary })
    }
}

impl ReachabilityProbe for IpRouteProbe {
    fn is_network_reachable(&self) -> bool {
        std::process::Command::new(&self.ip_binary)
            .args(["route", "get", PROBE_ADDRESS])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Asks NetworkManager for its global connectivity state over D-Bus
pub struct NetworkManagerProbe {
    connection: zbus::blocking::Connection,
}

impl NetworkManagerProbe {
    /// Connect to the system bus and verify NetworkManager is available
    #[tracing::instrument]
    pub fn new() -> Result<Self, MonitorError> {
        let connection = zbus::blocking::Connection::system()?;

        let proxy = zbus::blocking::fdo::DBusProxy::new(&connection)?;
        let bus_name = zbus::names::BusName::try_from("org.freedesktop.NetworkManager")
            .map_err(|e| MonitorError::ProbeUnavailable {
                reason: e.to_string(),
            })?;
        let name_has_owner = proxy
            .name_has_owner(bus_name)
            .map_err(|e| MonitorError::ProbeUnavailable {
                reason: e.to_string(),
            })?;
        if !name_has_owner {
            return Err(MonitorError::ProbeUnavailable {
                reason: "NetworkManager not available".to_string(),
            });
        }

        Ok(Self { connection })
    }

    fn query_state(&self) -> Result<u32, zbus::Error> {
        let proxy = zbus::blocking::Proxy::new(
            &self.connection,
            "org.freedesktop.NetworkManager",
            "/org/freedesktop/NetworkManager",
            "org.freedesktop.NetworkManager",
        )?;
        let state: u32 = proxy.get_property("State")?;
        Ok(state)
    }
}

impl ReachabilityProbe for NetworkManagerProbe {
    fn is_network_reachable(&self) -> bool {
        match self.query_state() {
            Ok(state) => state == NM_STATE_CONNECTED_GLOBAL,
            Err(e) => {
                debug!(error = %e, "NetworkManager state query failed");
                false
            }
        }
    }
}

struct NetworkMonitorInner {
    probe: Arc<dyn ReachabilityProbe>,
    event_loop: EventLoopHandle,
    poll_interval: Duration,
    network_up: Mutex<Option<bool>>,
    callback: Mutex<Option<Callback>>,
    polling: Mutex<Option<JoinHandle<()>>>,
}

/// Polls network reachability and reports when it comes up
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<NetworkMonitorInner>,
}

impl NetworkMonitor {
    pub fn new(
        probe: Arc<dyn ReachabilityProbe>,
        event_loop: EventLoopHandle,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(NetworkMonitorInner {
                probe,
                event_loop,
                poll_interval,
                network_up: Mutex::new(None),
                callback: Mutex::new(None),
                polling: Mutex::new(None),
            }),
        }
    }

    /// Called on the event loop each time connectivity is detected
    pub fn set_on_network_up(&self, callback: Callback) {
        *lock(&self.inner.callback) = Some(callback);
    }

    /// Start polling; the first check happens right away
    ///
    /// Enabling an enabled monitor does nothing.
    pub fn enable(&self) -> Result<(), MonitorError> {
        let mut polling = lock(&self.inner.polling);
        if polling.is_some() {
            debug!("Network monitor already enabled");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MonitorError::NoRuntime)?;
        *polling = Some(runtime.spawn(poll_loop(
            Arc::downgrade(&self.inner),
            self.inner.poll_interval,
        )));
        debug!(
            poll_interval_ms = self.inner.poll_interval.as_millis() as u64,
            "Network monitor enabled"
        );
        Ok(())
    }

    /// Stop polling and forget the last observed state
    pub fn disable(&self) {
        if let Some(handle) = lock(&self.inner.polling).take() {
            handle.abort();
            debug!("Network monitor disabled");
        }
        *lock(&self.inner.network_up) = None;
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.inner.polling).is_some()
    }

    /// Whether the network was up at the last check
    ///
    /// `false` until the first check completes.
    pub fn is_network_up(&self) -> bool {
        lock(&self.inner.network_up).unwrap_or(false)
    }

    /// Run the probe once, off the async worker threads
    pub async fn check_network_state(&self) -> bool {
        self.inner.check_network_state().await
    }

    /// Record a probe result, posting the callback if the network just came up
    pub fn record_reachability(&self, network_up: bool) {
        self.inner.record_reachability(network_up);
    }
}

impl NetworkMonitorInner {
    async fn check_network_state(&self) -> bool {
        let probe = Arc::clone(&self.probe);
        let network_up = tokio::task::spawn_blocking(move || probe.is_network_reachable())
            .await
            .unwrap_or(false);
        self.record_reachability(network_up);
        network_up
    }

    fn record_reachability(&self, network_up: bool) {
        let network_just_went_up = {
            let mut last = lock(&self.network_up);
            let was_up = last.unwrap_or(false);
            *last = Some(network_up);
            !was_up && network_up
        };

        if network_just_went_up {
            info!("Network connectivity was detected");
            if let Some(callback) = lock(&self.callback).clone() {
                self.event_loop.post(move || callback());
            }
        }
    }
}

async fn poll_loop(monitor: Weak<NetworkMonitorInner>, poll_interval: Duration) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(monitor) = monitor.upgrade() else {
            return;
        };
        monitor.check_network_state().await;
    }
}
