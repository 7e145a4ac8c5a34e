//! VPN tunnel state monitoring
//!
//! Subscribes to a [`TunnelStateSource`] and turns tunnel transitions into
//! callbacks posted on the event loop.

use crate::runtime::{lock, Callback, EventLoopHandle};
use crate::types::{DropReason, TunnelState};
use crate::vpn::tunnel::{ObserverId, TunnelObserver, TunnelStateSource};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Callback for drops that reconnecting cannot fix
pub type FatalCallback = Arc<dyn Fn(DropReason) + Send + Sync>;

#[derive(Default, Clone)]
struct VpnCallbacks {
    on_drop: Option<Callback>,
    on_restore: Option<Callback>,
    on_disconnect: Option<Callback>,
    on_fatal: Option<FatalCallback>,
}

struct VpnMonitorInner {
    source: Arc<dyn TunnelStateSource>,
    event_loop: EventLoopHandle,
    callbacks: Mutex<VpnCallbacks>,
    registration: Mutex<Option<ObserverId>>,
    current: Mutex<Option<TunnelState>>,
}

/// Calls the configured callbacks whenever the tunnel drops or comes back
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct VpnMonitor {
    inner: Arc<VpnMonitorInner>,
}

/// Registered with the tunnel source; holds the monitor weakly
struct Forwarder(Weak<VpnMonitorInner>);

impl TunnelObserver for Forwarder {
    fn status_update(&self, state: &TunnelState) {
        if let Some(inner) = self.0.upgrade() {
            inner.status_update(*state);
        }
    }
}

impl VpnMonitor {
    pub fn new(source: Arc<dyn TunnelStateSource>, event_loop: EventLoopHandle) -> Self {
        Self {
            inner: Arc::new(VpnMonitorInner {
                source,
                event_loop,
                callbacks: Mutex::new(VpnCallbacks::default()),
                registration: Mutex::new(None),
                current: Mutex::new(None),
            }),
        }
    }

    /// Called for recoverable drops
    pub fn set_on_drop(&self, callback: Callback) {
        lock(&self.inner.callbacks).on_drop = Some(callback);
    }

    /// Called when the tunnel is connected
    pub fn set_on_restore(&self, callback: Callback) {
        lock(&self.inner.callbacks).on_restore = Some(callback);
    }

    /// Called when the tunnel is disconnected on purpose
    pub fn set_on_disconnect(&self, callback: Callback) {
        lock(&self.inner.callbacks).on_disconnect = Some(callback);
    }

    /// Called for drops whose reason makes reconnecting pointless
    pub fn set_on_fatal(&self, callback: FatalCallback) {
        lock(&self.inner.callbacks).on_fatal = Some(callback);
    }

    /// Subscribe to the tunnel source
    ///
    /// The source delivers its current state during this call. Enabling an
    /// enabled monitor does nothing.
    pub fn enable(&self) {
        let mut registration = lock(&self.inner.registration);
        if registration.is_some() {
            debug!("VPN monitor already enabled");
            return;
        }
        let forwarder = Arc::new(Forwarder(Arc::downgrade(&self.inner)));
        *registration = Some(self.inner.source.register(forwarder));
        debug!("VPN monitor enabled");
    }

    pub fn disable(&self) {
        if let Some(id) = lock(&self.inner.registration).take() {
            self.inner.source.unregister(id);
            *lock(&self.inner.current) = None;
            debug!("VPN monitor disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.inner.registration).is_some()
    }

    /// Last state received from the tunnel source
    pub fn current_state(&self) -> Option<TunnelState> {
        *lock(&self.inner.current)
    }
}

impl VpnMonitorInner {
    fn status_update(&self, state: TunnelState) {
        *lock(&self.current) = Some(state);
        let callbacks = lock(&self.callbacks).clone();

        match state {
            TunnelState::Dropped(reason) if reason.is_fatal() => {
                if let Some(callback) = callbacks.on_fatal {
                    self.event_loop.post(move || callback(reason));
                }
            }
            TunnelState::Dropped(_) => self.post(callbacks.on_drop),
            TunnelState::Connected => self.post(callbacks.on_restore),
            TunnelState::Disconnected => self.post(callbacks.on_disconnect),
            TunnelState::Connecting | TunnelState::Disconnecting => {}
        }
    }

    fn post(&self, callback: Option<Callback>) {
        if let Some(callback) = callback {
            self.event_loop.post(move || callback());
        }
    }
}
