//! VPN reconnection with exponential backoff
//!
//! This module provides ReconnectionCoordinator, the single authority that
//! decides when a reconnection attempt is made. It listens to the VPN,
//! network and session monitors, and uses the [`Scheduler`] to fire attempts
//! so that at most one attempt is ever pending.

use crate::error::{CoordinatorError, ErrorSink, MonitorError, RelinkError};
use crate::runtime::{lock, Callback};
use crate::scheduler::Scheduler;
use crate::types::{DropReason, TaskId, TunnelStatus};
use crate::vpn::network_monitor::NetworkMonitor;
use crate::vpn::session_monitor::SessionMonitor;
use crate::vpn::tunnel::TunnelConnector;
use crate::vpn::vpn_monitor::VpnMonitor;
use rand::Rng;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backoff settings for reconnection attempts
///
/// The delay before attempt `n` (0-based) is `base^n * uniform(jitter_min,
/// jitter_max)` seconds, optionally capped at `max_delay_secs`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BackoffPolicy {
    /// Growth factor between consecutive attempts
    #[serde(default = "default_base")]
    pub base: f64,

    /// Lower bound of the random jitter factor
    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,

    /// Upper bound of the random jitter factor
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,

    /// Delay before re-checking when an attempt was due but the network was
    /// down or the session locked
    #[serde(default = "default_recheck_delay")]
    pub recheck_delay_ms: u64,

    /// Optional cap on the delay; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_secs: Option<u64>,
}

fn default_base() -> f64 {
    2.0
}
fn default_jitter_min() -> f64 {
    0.9
}
fn default_jitter_max() -> f64 {
    1.1
}
fn default_recheck_delay() -> u64 {
    500
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: default_base(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
            recheck_delay_ms: default_recheck_delay(),
            max_delay_secs: None,
        }
    }
}

impl BackoffPolicy {
    /// Validate the entire policy
    ///
    /// # Returns
    ///
    /// * `Ok(())` if all fields are valid
    /// * `Err(PolicyValidationError)` with the first validation error encountered
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if !(1.0..=10.0).contains(&self.base) {
            return Err(PolicyValidationError::InvalidBase(self.base));
        }
        if !(self.jitter_min > 0.0 && self.jitter_min <= self.jitter_max && self.jitter_max <= 2.0)
        {
            return Err(PolicyValidationError::InvalidJitterRange(
                self.jitter_min,
                self.jitter_max,
            ));
        }
        if self.recheck_delay_ms < 1 || self.recheck_delay_ms > 60_000 {
            return Err(PolicyValidationError::InvalidRecheckDelay(
                self.recheck_delay_ms,
            ));
        }
        if self.max_delay_secs == Some(0) {
            return Err(PolicyValidationError::InvalidMaxDelay);
        }
        Ok(())
    }

    /// Delay before attempt number `retry_count`, with random jitter
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(self.jitter_min..=self.jitter_max);
        self.delay_with_jitter(retry_count, jitter)
    }

    /// Delay before attempt number `retry_count` for a given jitter factor
    pub fn delay_with_jitter(&self, retry_count: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let mut secs = self.base.powi(exponent) * jitter;
        if let Some(max) = self.max_delay_secs {
            secs = secs.min(max as f64);
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Bounds of [`delay_for`](Self::delay_for) for `retry_count`
    pub fn delay_window(&self, retry_count: u32) -> (Duration, Duration) {
        (
            self.delay_with_jitter(retry_count, self.jitter_min),
            self.delay_with_jitter(retry_count, self.jitter_max),
        )
    }

    pub fn recheck_delay(&self) -> Duration {
        Duration::from_millis(self.recheck_delay_ms)
    }
}

/// Validation errors for BackoffPolicy
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyValidationError {
    #[error("base must be between 1 and 10, got: {0}")]
    InvalidBase(f64),

    #[error("jitter range must satisfy 0 < jitter_min <= jitter_max <= 2, got: {0}..{1}")]
    InvalidJitterRange(f64, f64),

    #[error("recheck_delay_ms must be between 1 and 60000, got: {0}")]
    InvalidRecheckDelay(u64),

    #[error("max_delay_secs must be at least 1 when set")]
    InvalidMaxDelay,
}

/// The three monitors the coordinator listens to
#[derive(Clone)]
pub struct Monitors {
    pub vpn: VpnMonitor,
    pub network: NetworkMonitor,
    pub session: SessionMonitor,
}

/// Mutable reconnection state
#[derive(Debug, Default)]
struct ReconnectionState {
    enabled: bool,
    retry_count: u32,
    /// Set iff exactly one attempt is scheduled
    pending_reconnect_task_id: Option<TaskId>,
    last_known_tunnel_state: TunnelStatus,
}

struct CoordinatorShared {
    state: Mutex<ReconnectionState>,
    scheduler: Scheduler,
    policy: BackoffPolicy,
    monitors: Monitors,
    connector: Arc<dyn TunnelConnector>,
    error_sink: Arc<dyn ErrorSink>,
    self_ref: Weak<CoordinatorShared>,
}

/// Decides when to reconnect a dropped VPN tunnel
///
/// The monitors and the scheduler call the `on_*` handlers from the event
/// loop; calling them from another thread is also safe, since all state sits
/// behind one lock. Cloning yields another handle to the same coordinator.
#[derive(Clone)]
pub struct ReconnectionCoordinator {
    shared: Arc<CoordinatorShared>,
}

impl ReconnectionCoordinator {
    /// Create a coordinator and hook it into the monitors' callback slots
    ///
    /// The monitors only hold weak references back to the coordinator.
    pub fn new(
        scheduler: Scheduler,
        policy: BackoffPolicy,
        monitors: Monitors,
        connector: Arc<dyn TunnelConnector>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let shared = Arc::new_cyclic(|self_ref| CoordinatorShared {
            state: Mutex::new(ReconnectionState::default()),
            scheduler,
            policy,
            monitors,
            connector,
            error_sink,
            self_ref: self_ref.clone(),
        });

        let weak = Arc::downgrade(&shared);
        let monitors = &shared.monitors;
        monitors
            .vpn
            .set_on_drop(bind(&weak, CoordinatorShared::on_vpn_dropped));
        monitors
            .vpn
            .set_on_restore(bind(&weak, CoordinatorShared::on_vpn_restored));
        monitors
            .vpn
            .set_on_disconnect(bind(&weak, CoordinatorShared::on_vpn_disconnected));
        let fatal = weak.clone();
        monitors.vpn.set_on_fatal(Arc::new(move |reason| {
            if let Some(shared) = fatal.upgrade() {
                shared.on_vpn_fatal(reason);
            }
        }));
        monitors
            .network
            .set_on_network_up(bind(&weak, CoordinatorShared::on_network_up));
        monitors
            .session
            .set_on_session_unlocked(bind(&weak, CoordinatorShared::on_session_unlocked));

        Self { shared }
    }

    /// Enable the monitors and start reacting to their events
    ///
    /// The VPN monitor delivers the current tunnel state as part of this
    /// call, so a drop that happened earlier is not missed.
    #[tracing::instrument(skip(self))]
    pub fn enable(&self) -> Result<(), RelinkError> {
        {
            let mut state = lock(&self.shared.state);
            if state.enabled {
                return Err(CoordinatorError::AlreadyEnabled.into());
            }
            state.enabled = true;
            state.retry_count = 0;
            state.last_known_tunnel_state = TunnelStatus::Disconnected;
            self.shared.cancel_pending(&mut state);
        }

        if let Err(e) = self.shared.enable_monitors() {
            self.disable();
            return Err(e.into());
        }

        info!("VPN reconnector enabled");
        Ok(())
    }

    /// Disable the monitors and cancel any scheduled attempt
    pub fn disable(&self) {
        let monitors = &self.shared.monitors;
        monitors.vpn.disable();
        monitors.network.disable();
        monitors.session.disable();

        let mut state = lock(&self.shared.state);
        self.shared.cancel_pending(&mut state);
        if state.enabled {
            state.enabled = false;
            info!("VPN reconnector disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.shared.state).enabled
    }

    /// Whether a reconnection attempt is pending
    pub fn is_reconnection_scheduled(&self) -> bool {
        lock(&self.shared.state)
            .pending_reconnect_task_id
            .is_some()
    }

    /// Scheduler task of the pending attempt, if any
    pub fn pending_reconnect_task(&self) -> Option<TaskId> {
        lock(&self.shared.state).pending_reconnect_task_id
    }

    /// Number of attempts made since the last reset
    pub fn retry_count(&self) -> u32 {
        lock(&self.shared.state).retry_count
    }

    pub fn tunnel_status(&self) -> TunnelStatus {
        lock(&self.shared.state).last_known_tunnel_state
    }

    pub fn on_vpn_dropped(&self) {
        self.shared.on_vpn_dropped();
    }

    pub fn on_vpn_restored(&self) {
        self.shared.on_vpn_restored();
    }

    pub fn on_vpn_disconnected(&self) {
        self.shared.on_vpn_disconnected();
    }

    pub fn on_vpn_fatal(&self, reason: DropReason) {
        self.shared.on_vpn_fatal(reason);
    }

    pub fn on_network_up(&self) {
        self.shared.on_network_up();
    }

    pub fn on_session_unlocked(&self) {
        self.shared.on_session_unlocked();
    }
}

/// Wrap a handler into a monitor callback holding the coordinator weakly
fn bind(weak: &Weak<CoordinatorShared>, handler: fn(&CoordinatorShared)) -> Callback {
    let weak = weak.clone();
    Arc::new(move || {
        if let Some(shared) = weak.upgrade() {
            handler(&shared);
        }
    })
}

/// Which precondition an event satisfied, so only the other one is checked
#[derive(Debug, Clone, Copy)]
enum Trigger {
    NetworkUp,
    SessionUnlocked,
}

impl CoordinatorShared {
    fn enable_monitors(&self) -> Result<(), MonitorError> {
        self.monitors.vpn.enable();
        self.monitors.network.enable()?;
        self.monitors.session.enable()?;
        Ok(())
    }

    fn on_vpn_dropped(&self) {
        let mut state = lock(&self.state);
        if !state.enabled {
            return;
        }
        info!("VPN connection drop was detected");
        state.last_known_tunnel_state = TunnelStatus::Dropped;

        // A newer drop supersedes whatever was scheduled for the previous one
        self.cancel_pending(&mut state);

        let delay = self.policy.delay_for(state.retry_count);
        self.schedule_attempt(&mut state, delay);
        info!(
            "Reconnection attempt #{} scheduled in {:.2} seconds",
            state.retry_count,
            delay.as_secs_f64()
        );
    }

    fn on_vpn_restored(&self) {
        let mut state = lock(&self.state);
        if !state.enabled {
            return;
        }
        debug!("VPN connection is up");
        state.last_known_tunnel_state = TunnelStatus::Connected;
        state.retry_count = 0;
        self.cancel_pending(&mut state);
    }

    fn on_vpn_disconnected(&self) {
        let mut state = lock(&self.state);
        if !state.enabled {
            return;
        }
        debug!("VPN connection is down on request");
        state.last_known_tunnel_state = TunnelStatus::Disconnected;
        state.retry_count = 0;
        self.cancel_pending(&mut state);
    }

    fn on_vpn_fatal(&self, reason: DropReason) {
        {
            let mut state = lock(&self.state);
            if !state.enabled {
                return;
            }
            info!(%reason, "VPN reconnection not possible: fatal connection error");
            state.last_known_tunnel_state = TunnelStatus::Disconnected;
            state.retry_count = 0;
            self.cancel_pending(&mut state);
        }
        self.error_sink
            .report(&CoordinatorError::FatalDrop { reason }.into());
    }

    fn on_network_up(&self) {
        self.on_precondition_met(Trigger::NetworkUp);
    }

    fn on_session_unlocked(&self) {
        self.on_precondition_met(Trigger::SessionUnlocked);
    }

    fn on_precondition_met(&self, trigger: Trigger) {
        let mut state = lock(&self.state);
        if !state.enabled {
            return;
        }
        debug!(?trigger, "Resetting reconnection backoff");
        state.retry_count = 0;

        if state.last_known_tunnel_state != TunnelStatus::Dropped {
            debug!("VPN reconnection not necessary: connection didn't drop");
            return;
        }

        let other_precondition_met = match trigger {
            Trigger::NetworkUp => self.monitors.session.is_session_unlocked(),
            Trigger::SessionUnlocked => self.monitors.network.is_network_up(),
        };
        if !other_precondition_met {
            debug!(?trigger, "VPN reconnection not possible yet");
            return;
        }

        if state.pending_reconnect_task_id.is_some() {
            warn!("There is already a scheduled VPN reconnection attempt");
            return;
        }

        self.schedule_attempt(&mut state, Duration::ZERO);
        info!("Reconnection attempt #{} scheduled now", state.retry_count);
    }

    /// Runs when a scheduled attempt comes due
    ///
    /// `assigned` is filled in by `schedule_attempt` while it holds the state
    /// lock, so it is always set once the lock is taken here.
    fn on_reconnect_due(&self, assigned: &OnceLock<TaskId>) {
        let mut state = lock(&self.state);
        let Some(&task) = assigned.get() else {
            warn!("Reconnection task fired without an id");
            return;
        };
        if state.pending_reconnect_task_id != Some(task) {
            debug!(%task, "Ignoring superseded reconnection task");
            return;
        }
        state.pending_reconnect_task_id = None;

        let blocker = if !self.monitors.network.is_network_up() {
            Some("network is down")
        } else if !self.monitors.session.is_session_unlocked() {
            Some("session is locked")
        } else {
            None
        };

        // No attempt was made, so stay on the same backoff tier
        if let Some(blocker) = blocker {
            info!("VPN reconnection not possible: {}", blocker);
            let delay = self.policy.recheck_delay();
            self.schedule_attempt(&mut state, delay);
            return;
        }

        state.retry_count += 1;
        info!("Reconnecting (attempt #{})...", state.retry_count);
        drop(state);

        self.connector.reconnect();
    }

    fn schedule_attempt(&self, state: &mut ReconnectionState, delay: Duration) {
        let coordinator = self.self_ref.clone();
        let assigned: Arc<OnceLock<TaskId>> = Arc::new(OnceLock::new());
        let task_id = Arc::clone(&assigned);

        let id = self.scheduler.run_after(delay, move || {
            if let Some(shared) = coordinator.upgrade() {
                shared.on_reconnect_due(&task_id);
            }
        });
        let _ = assigned.set(id);
        state.pending_reconnect_task_id = Some(id);
    }

    fn cancel_pending(&self, state: &mut ReconnectionState) {
        if let Some(task) = state.pending_reconnect_task_id.take() {
            self.scheduler.cancel_task(task);
            debug!(%task, "Scheduled reconnection cancelled");
        }
    }
}
