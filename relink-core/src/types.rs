//! Shared value types
//!
//! Identifiers handed out by the scheduler and the closed set of tunnel
//! states reported by the VPN connection layer.

/// Handle of a task registered with the [`Scheduler`](crate::scheduler::Scheduler)
///
/// Ids are assigned monotonically and never reused while the scheduler lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value of the id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why the tunnel layer reported the connection as dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The tunnel went away without the user asking for it
    ConnectionLost,

    /// The server stopped answering keepalives
    Timeout,

    /// The server rejected the credentials
    AuthDenied,

    /// The account already has the maximum number of sessions open
    MaximumSessionsReached,
}

impl DropReason {
    /// Whether reconnecting with the same parameters can never succeed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DropReason::AuthDenied | DropReason::MaximumSessionsReached
        )
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::ConnectionLost => write!(f, "connection lost"),
            DropReason::Timeout => write!(f, "timeout"),
            DropReason::AuthDenied => write!(f, "authentication denied"),
            DropReason::MaximumSessionsReached => write!(f, "maximum sessions reached"),
        }
    }
}

/// Tunnel states published by the VPN connection layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    /// Not connected, by user request or because it never was
    #[default]
    Disconnected,

    /// Establishing the tunnel
    Connecting,

    /// Tunnel is up
    Connected,

    /// Tearing the tunnel down on request
    Disconnecting,

    /// Tunnel failed or went away unexpectedly
    Dropped(DropReason),
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Disconnected => write!(f, "disconnected"),
            TunnelState::Connecting => write!(f, "connecting"),
            TunnelState::Connected => write!(f, "connected"),
            TunnelState::Disconnecting => write!(f, "disconnecting"),
            TunnelState::Dropped(reason) => write!(f, "dropped: {}", reason),
        }
    }
}

/// What the reconnection coordinator last learned about the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelStatus {
    Connected,
    #[default]
    Disconnected,
    Dropped,
}
