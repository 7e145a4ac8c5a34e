//! User session lock monitoring
//!
//! Tracks whether the user session is locked and calls the configured
//! callback when it gets unlocked. On systemd machines the lock state comes
//! from logind over D-Bus; elsewhere the configured default is reported.

use crate::config::{SessionBackend, SessionMonitorConfig};
use crate::error::MonitorError;
use crate::runtime::{lock, Callback, EventLoopHandle};
use futures::StreamExt;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::zvariant::OwnedObjectPath;

const BUS_NAME: &str = "org.freedesktop.login1";
const MANAGER_PATH: &str = "/org/freedesktop/login1";
const MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";
const SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";

/// Lock notification delivered by the session transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Locked,
    Unlocked,
}

struct SessionMonitorInner {
    config: SessionMonitorConfig,
    event_loop: EventLoopHandle,
    locked: Mutex<Option<bool>>,
    callback: Mutex<Option<Callback>>,
    enabled: Mutex<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Reports session unlocks
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct SessionMonitor {
    inner: Arc<SessionMonitorInner>,
}

impl SessionMonitor {
    pub fn new(config: SessionMonitorConfig, event_loop: EventLoopHandle) -> Self {
        Self {
            inner: Arc::new(SessionMonitorInner {
                config,
                event_loop,
                locked: Mutex::new(None),
                callback: Mutex::new(None),
                enabled: Mutex::new(false),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Called on the event loop each time the session is unlocked
    pub fn set_on_session_unlocked(&self, callback: Callback) {
        *lock(&self.inner.callback) = Some(callback);
    }

    /// Start listening for lock notifications
    ///
    /// With the logind backend this spawns the D-Bus listener and must be
    /// called from within a Tokio runtime. Enabling an enabled monitor does
    /// nothing.
    pub fn enable(&self) -> Result<(), MonitorError> {
        let mut enabled = lock(&self.inner.enabled);
        if *enabled {
            debug!("Session monitor already enabled");
            return Ok(());
        }

        if self.inner.config.backend == SessionBackend::Logind {
            let runtime =
                tokio::runtime::Handle::try_current().map_err(|_| MonitorError::NoRuntime)?;
            let monitor = Arc::downgrade(&self.inner);
            let assume_unlocked = self.inner.config.assume_unlocked;
            *lock(&self.inner.listener) = Some(runtime.spawn(async move {
                if let Err(e) = listen_logind(monitor).await {
                    warn!(
                        error = %e,
                        assume_unlocked,
                        "Session lock monitoring unavailable, using configured default"
                    );
                }
            }));
        }

        *enabled = true;
        debug!(backend = ?self.inner.config.backend, "Session monitor enabled");
        Ok(())
    }

    pub fn disable(&self) {
        let mut enabled = lock(&self.inner.enabled);
        if !*enabled {
            return;
        }
        if let Some(handle) = lock(&self.inner.listener).take() {
            handle.abort();
        }
        *lock(&self.inner.locked) = None;
        *enabled = false;
        debug!("Session monitor disabled");
    }

    pub fn is_enabled(&self) -> bool {
        *lock(&self.inner.enabled)
    }

    /// Whether the session is unlocked
    ///
    /// Until a lock state has been observed this is `assume_unlocked`.
    pub fn is_session_unlocked(&self) -> bool {
        match *lock(&self.inner.locked) {
            Some(locked) => !locked,
            None => self.inner.config.assume_unlocked,
        }
    }

    /// Feed a lock notification from the session transport
    pub fn handle_signal(&self, signal: SessionSignal) {
        self.inner.handle_signal(signal);
    }
}

impl SessionMonitorInner {
    fn handle_signal(&self, signal: SessionSignal) {
        match signal {
            SessionSignal::Locked => {
                *lock(&self.locked) = Some(true);
                debug!("Session locked");
            }
            SessionSignal::Unlocked => {
                *lock(&self.locked) = Some(false);
                info!("Session unlocked");
                if let Some(callback) = lock(&self.callback).clone() {
                    self.event_loop.post(move || callback());
                }
            }
        }
    }

    /// Record the lock state without notifying anyone
    fn record_locked_hint(&self, locked: bool) {
        *lock(&self.locked) = Some(locked);
    }
}

/// Follow `Lock`/`Unlock` on the user's logind session
async fn listen_logind(monitor: Weak<SessionMonitorInner>) -> Result<(), MonitorError> {
    let connection = zbus::Connection::system().await?;

    // "auto" is the caller's session, or the user's display session. There
    // is none when the machine is only driven remotely (ssh), and then there
    // is no lock screen to follow either.
    let manager = zbus::Proxy::new(&connection, BUS_NAME, MANAGER_PATH, MANAGER_INTERFACE).await?;
    let session_path: OwnedObjectPath = manager
        .call("GetSession", &("auto",))
        .await
        .map_err(|_| MonitorError::NoActiveSession)?;

    let session =
        zbus::Proxy::new(&connection, BUS_NAME, session_path.clone(), SESSION_INTERFACE).await?;
    let mut lock_signals = session.receive_signal("Lock").await?;
    let mut unlock_signals = session.receive_signal("Unlock").await?;

    let locked: bool = session
        .get_property("LockedHint")
        .await
        .map_err(zbus::Error::from)?;
    match monitor.upgrade() {
        Some(monitor) => monitor.record_locked_hint(locked),
        None => return Ok(()),
    }
    info!(session = %session_path.as_str(), locked, "Following logind session lock state");

    loop {
        let signal = tokio::select! {
            Some(_) = lock_signals.next() => SessionSignal::Locked,
            Some(_) = unlock_signals.next() => SessionSignal::Unlocked,
            else => return Ok(()),
        };
        let Some(monitor) = monitor.upgrade() else {
            return Ok(());
        };
        monitor.handle_signal(signal);
    }
}
