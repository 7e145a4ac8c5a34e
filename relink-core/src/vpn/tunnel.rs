//! Tunnel layer boundary
//!
//! The VPN connection itself is managed elsewhere. This module defines what
//! the reconnection subsystem needs from it (an observable state stream and
//! a way to ask for a reconnect) and provides the small implementations the
//! `relink` daemon uses: an in-process state bus, an interface watcher that
//! feeds it, and a connector that runs a shell command.

use crate::runtime::lock;
use crate::types::{DropReason, TunnelState};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives every tunnel state transition
pub trait TunnelObserver: Send + Sync {
    fn status_update(&self, state: &TunnelState);
}

/// Registration handle returned by [`TunnelStateSource::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

/// Observable tunnel state
///
/// `register` must deliver the current state to the new observer before it
/// returns, then every later transition in order.
pub trait TunnelStateSource: Send + Sync {
    fn register(&self, observer: Arc<dyn TunnelObserver>) -> ObserverId;
    fn unregister(&self, id: ObserverId);
}

/// Issues a reconnection request to the tunnel layer
///
/// Fire-and-forget: the outcome shows up later as a state transition.
pub trait TunnelConnector: Send + Sync {
    fn reconnect(&self);
}

struct BusState {
    current: TunnelState,
    next_id: u64,
    observers: Vec<(ObserverId, Arc<dyn TunnelObserver>)>,
}

/// In-process [`TunnelStateSource`]
///
/// Observers are notified while the bus is locked so that no observer sees
/// transitions out of order; they must not call back into the bus.
pub struct TunnelStateBus {
    state: Mutex<BusState>,
}

impl TunnelStateBus {
    pub fn new(initial: TunnelState) -> Self {
        Self {
            state: Mutex::new(BusState {
                current: initial,
                next_id: 0,
                observers: Vec::new(),
            }),
        }
    }

    /// Record a new state and notify every observer
    pub fn publish(&self, new_state: TunnelState) {
        let mut state = lock(&self.state);
        state.current = new_state;
        debug!(state = %new_state, observers = state.observers.len(), "Tunnel state published");
        for (_, observer) in &state.observers {
            observer.status_update(&new_state);
        }
    }

    pub fn current(&self) -> TunnelState {
        lock(&self.state).current
    }

    /// Compute the next state from the current one and publish it if it changed
    ///
    /// The bus stays locked in between, so concurrent writers never act on a
    /// stale state. Returns the state after the transition.
    pub fn transition<F>(&self, next: F) -> TunnelState
    where
        F: FnOnce(TunnelState) -> TunnelState,
    {
        let mut state = lock(&self.state);
        let previous = state.current;
        let new_state = next(previous);
        if new_state != previous {
            state.current = new_state;
            debug!(from = %previous, to = %new_state, "Tunnel state changed");
            for (_, observer) in &state.observers {
                observer.status_update(&new_state);
            }
        }
        new_state
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.state).observers.len()
    }
}

impl TunnelStateSource for TunnelStateBus {
    fn register(&self, observer: Arc<dyn TunnelObserver>) -> ObserverId {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = ObserverId(state.next_id);
        observer.status_update(&state.current);
        state.observers.push((id, observer));
        id
    }

    fn unregister(&self, id: ObserverId) {
        lock(&self.state).observers.retain(|(existing, _)| *existing != id);
    }
}

/// Longest a reconnect command may run before the attempt counts as failed
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Reconnects by running a shell command
///
/// The tunnel is marked `Connecting` while the command runs. Once it exits,
/// the attempt is settled from the interface: up means `Connected`, anything
/// else is a new drop, which moves the coordinator to its next backoff tier.
pub struct CommandConnector {
    command: String,
    interface: String,
    bus: Arc<TunnelStateBus>,
}

impl CommandConnector {
    pub fn new(command: String, interface: String, bus: Arc<TunnelStateBus>) -> Self {
        Self {
            command,
            interface,
            bus,
        }
    }
}

impl TunnelConnector for CommandConnector {
    fn reconnect(&self) {
        self.bus.publish(TunnelState::Connecting);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No Tokio runtime available, reconnect command not run");
            settle_attempt(&self.bus, false);
            return;
        };

        let command = self.command.clone();
        let interface = self.interface.clone();
        let bus = Arc::clone(&self.bus);
        runtime.spawn(async move {
            info!(command = %command, "Running reconnect command");
            let run = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .kill_on_drop(true)
                .status();
            match tokio::time::timeout(RECONNECT_TIMEOUT, run).await {
                Ok(Ok(status)) if status.success() => debug!("Reconnect command finished"),
                Ok(Ok(status)) => warn!(%status, "Reconnect command failed"),
                Ok(Err(e)) => warn!(error = %e, "Failed to spawn reconnect command"),
                Err(_) => warn!(
                    timeout_secs = RECONNECT_TIMEOUT.as_secs(),
                    "Reconnect command timed out"
                ),
            }
            settle_attempt(&bus, is_interface_up(&interface));
        });
    }
}

/// Resolve a `Connecting` tunnel once its reconnect attempt is over
///
/// Leaves the state alone if something else already moved it on.
fn settle_attempt(bus: &TunnelStateBus, interface_up: bool) -> TunnelState {
    bus.transition(|current| match current {
        TunnelState::Connecting if interface_up => TunnelState::Connected,
        TunnelState::Connecting => TunnelState::Dropped(DropReason::ConnectionLost),
        other => other,
    })
}

/// Derives tunnel state from a network interface and publishes it
///
/// An interface that disappears (or goes down) after having been up is
/// reported as a drop; one that was never up is just disconnected. While a
/// reconnect attempt is in flight the tunnel stays `Connecting` until the
/// interface comes up or the connector settles the attempt.
pub struct InterfaceWatcher {
    interface: String,
    bus: Arc<TunnelStateBus>,
    poll_interval: Duration,
}

impl InterfaceWatcher {
    pub fn new(interface: String, bus: Arc<TunnelStateBus>, poll_interval: Duration) -> Self {
        Self {
            interface,
            bus,
            poll_interval,
        }
    }

    /// Fold one observation into the tunnel state, publishing on change
    pub fn observe(&self, interface_up: bool) -> TunnelState {
        let mut previous = TunnelState::default();
        let next = self.bus.transition(|current| {
            previous = current;
            next_state(interface_up, current)
        });
        if next != previous {
            info!(interface = %self.interface, from = %previous, to = %next, "Tunnel state changed");
        }
        next
    }

    /// Poll the interface in the background
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let operstate = operstate_path(&self.interface);
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let up = match tokio::fs::read_to_string(&operstate).await {
                    Ok(contents) => interface_is_up(&contents),
                    Err(_) => false,
                };
                self.observe(up);
            }
        })
    }
}

fn next_state(interface_up: bool, current: TunnelState) -> TunnelState {
    match (interface_up, current) {
        (true, _) => TunnelState::Connected,
        (false, TunnelState::Connected) => TunnelState::Dropped(DropReason::ConnectionLost),
        (false, TunnelState::Connecting | TunnelState::Dropped(_)) => current,
        (false, _) => TunnelState::Disconnected,
    }
}

/// Whether `interface` exists and is up right now
pub fn is_interface_up(interface: &str) -> bool {
    std::fs::read_to_string(operstate_path(interface))
        .map(|contents| interface_is_up(&contents))
        .unwrap_or(false)
}

fn operstate_path(interface: &str) -> PathBuf {
    PathBuf::from("/sys/class/net")
        .join(interface)
        .join("operstate")
}

/// Point-to-point tunnels report "unknown" while they carry traffic
fn interface_is_up(operstate: &str) -> bool {
    matches!(operstate.trim(), "up" | "unknown")
}
