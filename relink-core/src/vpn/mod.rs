//! VPN reconnection module
//!
//! Monitors for the tunnel, the network and the user session, and the
//! coordinator that turns their events into scheduled reconnection attempts.

pub mod tunnel;

// Condition monitors feeding the coordinator
pub mod network_monitor;
pub mod session_monitor;
pub mod vpn_monitor;

pub mod reconnection;

// Public re-exports
pub use network_monitor::{IpRouteProbe, NetworkManagerProbe, NetworkMonitor, ReachabilityProbe};
pub use reconnection::{BackoffPolicy, Monitors, ReconnectionCoordinator};
pub use session_monitor::{SessionMonitor, SessionSignal};
pub use tunnel::{
    is_interface_up, CommandConnector, InterfaceWatcher, TunnelConnector, TunnelObserver,
    TunnelStateBus, TunnelStateSource,
};
pub use vpn_monitor::VpnMonitor;
