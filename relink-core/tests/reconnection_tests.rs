//! Tests for the reconnection coordinator
//!
//! The coordinator runs against real monitors fed by hand: tunnel states go
//! through a TunnelStateBus, reachability is recorded directly on the
//! network monitor and lock signals are handed to the session monitor.
//! Scheduled attempts are fired by moving a ManualClock to their timestamp.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relink_core::config::{SessionBackend, SessionMonitorConfig};
use relink_core::error::{ErrorSink, RelinkError};
use relink_core::runtime::{Clock, EventLoop, ManualClock, SystemClock};
use relink_core::scheduler::{Scheduler, DEFAULT_CHECK_INTERVAL};
use relink_core::types::{DropReason, TunnelState, TunnelStatus};
use relink_core::vpn::{
    BackoffPolicy, Monitors, NetworkMonitor, ReachabilityProbe, ReconnectionCoordinator,
    SessionMonitor, SessionSignal, TunnelConnector, TunnelStateBus, VpnMonitor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Probe with a fixed answer
struct FixedProbe(bool);

impl ReachabilityProbe for FixedProbe {
    fn is_network_reachable(&self) -> bool {
        self.0
    }
}

#[derive(Default)]
struct RecordingConnector {
    attempts: AtomicUsize,
    notify: Option<tokio::sync::mpsc::UnboundedSender<()>>,
}

impl TunnelConnector for RecordingConnector {
    fn reconnect(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(notify) = &self.notify {
            let _ = notify.send(());
        }
    }
}

#[derive(Default)]
struct CollectingSink(Mutex<Vec<String>>);

impl ErrorSink for CollectingSink {
    fn report(&self, error: &RelinkError) {
        self.0.lock().unwrap().push(error.to_string());
    }
}

struct Harness {
    clock: ManualClock,
    event_loop: EventLoop,
    scheduler: Scheduler,
    bus: Arc<TunnelStateBus>,
    network: NetworkMonitor,
    session: SessionMonitor,
    connector: Arc<RecordingConnector>,
    sink: Arc<CollectingSink>,
    coordinator: ReconnectionCoordinator,
}

impl Harness {
    /// Build a coordinator over a tunnel in `initial` state
    ///
    /// Must be called from within a Tokio runtime; the test bodies never
    /// await, so the network monitor's poll task never gets to run.
    fn new(initial: TunnelState) -> Self {
        let clock = ManualClock::default();
        let (event_loop, handle) = EventLoop::new();
        let sink = Arc::new(CollectingSink::default());
        let scheduler = Scheduler::new(
            Arc::new(clock.clone()),
            handle.clone(),
            sink.clone(),
            DEFAULT_CHECK_INTERVAL,
        );

        let bus = Arc::new(TunnelStateBus::new(initial));
        let network = NetworkMonitor::new(
            Arc::new(FixedProbe(false)),
            handle.clone(),
            Duration::from_secs(3600),
        );
        let session = SessionMonitor::new(
            SessionMonitorConfig {
                backend: SessionBackend::None,
                assume_unlocked: true,
            },
            handle.clone(),
        );
        let vpn = VpnMonitor::new(bus.clone(), handle);

        let connector = Arc::new(RecordingConnector::default());
        let coordinator = ReconnectionCoordinator::new(
            scheduler.clone(),
            BackoffPolicy::default(),
            Monitors {
                vpn,
                network: network.clone(),
                session: session.clone(),
            },
            connector.clone(),
            sink.clone(),
        );

        Self {
            clock,
            event_loop,
            scheduler,
            bus,
            network,
            session,
            connector,
            sink,
            coordinator,
        }
    }

    /// Enabled, tunnel connected, network up, session unlocked
    fn nominal() -> Self {
        let mut h = Self::new(TunnelState::Connected);
        h.coordinator.enable().unwrap();
        h.network.record_reachability(true);
        h.settle();
        assert_eq!(h.coordinator.tunnel_status(), TunnelStatus::Connected);
        assert!(!h.coordinator.is_reconnection_scheduled());
        h
    }

    fn settle(&mut self) {
        self.event_loop.run_until_idle();
    }

    fn publish(&mut self, state: TunnelState) {
        self.bus.publish(state);
        self.settle();
    }

    fn drop_tunnel(&mut self) {
        self.publish(TunnelState::Dropped(DropReason::ConnectionLost));
    }

    fn set_network(&mut self, up: bool) {
        self.network.record_reachability(up);
        self.settle();
    }

    fn session_signal(&mut self, signal: SessionSignal) {
        self.session.handle_signal(signal);
        self.settle();
    }

    /// Delay between now and the pending attempt
    fn pending_delay(&self) -> Duration {
        let task = self
            .coordinator
            .pending_reconnect_task()
            .expect("an attempt should be scheduled");
        let fire_at = self.scheduler.fire_time(task).expect("task is in scheduler");
        fire_at.duration_since(self.clock.now()).unwrap_or_default()
    }

    /// Move time to the pending attempt and let it run
    fn fire_pending(&mut self) {
        let delay = self.pending_delay();
        self.clock.advance(delay);
        assert_eq!(self.scheduler.run_tasks_ready_to_fire(), 1);
        self.settle();
    }

    fn attempts(&self) -> usize {
        self.connector.attempts.load(Ordering::SeqCst)
    }

    fn assert_single_pending_attempt(&self) {
        let scheduled = self.coordinator.is_reconnection_scheduled();
        assert_eq!(
            self.scheduler.number_of_remaining_tasks(),
            usize::from(scheduled),
            "scheduler and coordinator disagree about the pending attempt"
        );
    }
}

fn assert_in_window(delay: Duration, window: (Duration, Duration)) {
    assert!(
        delay >= window.0 && delay <= window.1,
        "{:?} not in {:?}..{:?}",
        delay,
        window.0,
        window.1
    );
}

#[tokio::test]
async fn test_drop_then_reconnect() {
    // Given: a healthy tunnel
    let mut h = Harness::nominal();

    // When: the tunnel drops
    h.drop_tunnel();

    // Then: one attempt is scheduled about a second from now
    assert!(h.coordinator.is_reconnection_scheduled());
    assert_in_window(h.pending_delay(), BackoffPolicy::default().delay_window(0));
    h.assert_single_pending_attempt();

    // When: the attempt comes due
    h.fire_pending();

    // Then: the tunnel layer was asked to reconnect exactly once
    assert_eq!(h.attempts(), 1);
    assert_eq!(h.coordinator.retry_count(), 1);
    assert!(!h.coordinator.is_reconnection_scheduled());
    h.assert_single_pending_attempt();
}

#[tokio::test]
async fn test_network_down_at_fire_time_rechecks_without_counting_attempt() {
    // Given: a dropped tunnel with an attempt scheduled
    let mut h = Harness::nominal();
    h.drop_tunnel();

    // When: the network goes away before the attempt comes due
    h.set_network(false);
    h.fire_pending();

    // Then: nothing was attempted and a recheck is scheduled
    assert_eq!(h.attempts(), 0);
    assert_eq!(h.coordinator.retry_count(), 0);
    assert!(h.coordinator.is_reconnection_scheduled());
    assert_eq!(h.pending_delay(), BackoffPolicy::default().recheck_delay());
    h.assert_single_pending_attempt();
}

#[tokio::test]
async fn test_locked_session_at_fire_time_rechecks() {
    let mut h = Harness::nominal();
    h.drop_tunnel();
    h.session_signal(SessionSignal::Locked);

    h.fire_pending();

    assert_eq!(h.attempts(), 0);
    assert_eq!(h.coordinator.retry_count(), 0);
    assert_eq!(h.pending_delay(), BackoffPolicy::default().recheck_delay());
}

#[tokio::test]
async fn test_recheck_attempts_once_preconditions_return() {
    let mut h = Harness::nominal();
    h.drop_tunnel();
    h.set_network(false);
    h.fire_pending();
    h.fire_pending();
    assert_eq!(h.attempts(), 0);

    // Network-up finds the recheck already pending and leaves it alone
    h.set_network(true);
    assert_eq!(h.scheduler.number_of_remaining_tasks(), 1);

    h.fire_pending();
    assert_eq!(h.attempts(), 1);
    assert_eq!(h.coordinator.retry_count(), 1);
}

#[tokio::test]
async fn test_backoff_grows_with_each_attempt() {
    let mut h = Harness::nominal();
    let policy = BackoffPolicy::default();

    for n in 0..6 {
        h.drop_tunnel();
        assert_in_window(h.pending_delay(), policy.delay_window(n));

        h.fire_pending();
        assert_eq!(h.coordinator.retry_count(), n + 1);
    }
    assert_eq!(h.attempts(), 6);
}

#[tokio::test]
async fn test_restore_resets_backoff_and_cancels_pending() {
    // Given: one failed attempt and a second one pending
    let mut h = Harness::nominal();
    h.drop_tunnel();
    h.fire_pending();
    h.drop_tunnel();
    assert_eq!(h.coordinator.retry_count(), 1);
    assert!(h.coordinator.is_reconnection_scheduled());

    // When: the tunnel comes back
    h.publish(TunnelState::Connected);

    // Then: the backoff is back at zero and nothing is pending
    assert_eq!(h.coordinator.retry_count(), 0);
    assert!(!h.coordinator.is_reconnection_scheduled());
    assert_eq!(h.scheduler.number_of_remaining_tasks(), 0);
    assert_eq!(h.coordinator.tunnel_status(), TunnelStatus::Connected);

    // And: the next drop starts from the first tier again
    h.drop_tunnel();
    assert_in_window(h.pending_delay(), BackoffPolicy::default().delay_window(0));
}

#[tokio::test]
async fn test_network_up_with_locked_session_schedules_nothing() {
    // Given: a dropped tunnel whose attempt was already made
    let mut h = Harness::nominal();
    h.drop_tunnel();
    h.fire_pending();
    assert!(!h.coordinator.is_reconnection_scheduled());

    // When: the network comes back while the session is locked
    h.session_signal(SessionSignal::Locked);
    h.set_network(false);
    h.set_network(true);

    // Then: the backoff resets but no attempt is scheduled
    assert_eq!(h.coordinator.retry_count(), 0);
    assert!(!h.coordinator.is_reconnection_scheduled());
    h.assert_single_pending_attempt();

    // When: the session is unlocked
    h.session_signal(SessionSignal::Unlocked);

    // Then: an attempt is scheduled immediately
    assert!(h.coordinator.is_reconnection_scheduled());
    assert_eq!(h.pending_delay(), Duration::ZERO);
    h.fire_pending();
    assert_eq!(h.attempts(), 2);
}

#[tokio::test]
async fn test_unlock_with_network_down_schedules_nothing() {
    let mut h = Harness::nominal();
    h.drop_tunnel();
    h.fire_pending();
    h.set_network(false);

    h.session_signal(SessionSignal::Unlocked);

    assert!(!h.coordinator.is_reconnection_scheduled());
}

#[tokio::test]
async fn test_network_up_does_not_duplicate_pending_attempt() {
    let mut h = Harness::nominal();
    h.drop_tunnel();
    let pending = h.coordinator.pending_reconnect_task();

    h.set_network(false);
    h.set_network(true);
    h.session_signal(SessionSignal::Unlocked);

    assert_eq!(h.coordinator.pending_reconnect_task(), pending);
    assert_eq!(h.scheduler.number_of_remaining_tasks(), 1);
}

#[tokio::test]
async fn test_network_up_resets_backoff() {
    let mut h = Harness::nominal();
    h.drop_tunnel();
    h.fire_pending();
    h.drop_tunnel();
    h.fire_pending();
    assert_eq!(h.coordinator.retry_count(), 2);

    h.set_network(false);
    h.set_network(true);

    assert_eq!(h.coordinator.retry_count(), 0);
}

#[tokio::test]
async fn test_repeated_drop_supersedes_pending_attempt() {
    let mut h = Harness::nominal();
    h.drop_tunnel();
    let first = h.coordinator.pending_reconnect_task().unwrap();

    h.drop_tunnel();
    let second = h.coordinator.pending_reconnect_task().unwrap();

    assert_ne!(first, second);
    assert!(h.scheduler.fire_time(first).is_none());
    assert_eq!(h.scheduler.number_of_remaining_tasks(), 1);
}

#[tokio::test]
async fn test_attempt_dispatched_before_restore_is_ignored() {
    // Given: an attempt that the scheduler has already handed to the event loop
    let mut h = Harness::nominal();
    h.drop_tunnel();
    let delay = h.pending_delay();

    // When: the tunnel is restored before the loop gets to run the attempt
    h.bus.publish(TunnelState::Connected);
    h.clock.advance(delay);
    assert_eq!(h.scheduler.run_tasks_ready_to_fire(), 1);
    h.settle();

    // Then: the stale attempt does nothing
    assert_eq!(h.attempts(), 0);
    assert_eq!(h.coordinator.retry_count(), 0);
    assert!(!h.coordinator.is_reconnection_scheduled());
}

#[tokio::test]
async fn test_user_disconnect_cancels_pending_attempt() {
    let mut h = Harness::nominal();
    h.drop_tunnel();

    h.publish(TunnelState::Disconnected);

    assert!(!h.coordinator.is_reconnection_scheduled());
    assert_eq!(h.scheduler.number_of_remaining_tasks(), 0);
    assert_eq!(h.coordinator.tunnel_status(), TunnelStatus::Disconnected);

    // A disconnected tunnel is not brought back by connectivity events
    h.set_network(false);
    h.set_network(true);
    assert!(!h.coordinator.is_reconnection_scheduled());
}

#[tokio::test]
async fn test_fatal_drop_is_reported_and_not_retried() {
    let mut h = Harness::nominal();
    h.drop_tunnel();

    h.publish(TunnelState::Dropped(DropReason::AuthDenied));

    assert!(!h.coordinator.is_reconnection_scheduled());
    assert_eq!(h.scheduler.number_of_remaining_tasks(), 0);
    assert_eq!(h.coordinator.tunnel_status(), TunnelStatus::Disconnected);
    let reported = h.sink.0.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].contains("authentication"), "{}", reported[0]);
}

#[tokio::test]
async fn test_transitional_states_are_ignored() {
    let mut h = Harness::nominal();
    h.drop_tunnel();
    let pending = h.coordinator.pending_reconnect_task();

    h.publish(TunnelState::Connecting);
    h.publish(TunnelState::Disconnecting);

    assert_eq!(h.coordinator.pending_reconnect_task(), pending);
    assert_eq!(h.coordinator.tunnel_status(), TunnelStatus::Dropped);
}

#[tokio::test]
async fn test_enable_picks_up_existing_drop() {
    let mut h = Harness::new(TunnelState::Dropped(DropReason::Timeout));

    h.coordinator.enable().unwrap();
    h.settle();

    assert_eq!(h.coordinator.tunnel_status(), TunnelStatus::Dropped);
    assert!(h.coordinator.is_reconnection_scheduled());
}

#[tokio::test]
async fn test_enable_twice_is_an_error() {
    let h = Harness::nominal();

    let result = h.coordinator.enable();

    assert!(matches!(result, Err(RelinkError::Coordinator(_))));
    assert!(h.coordinator.is_enabled());
}

#[tokio::test]
async fn test_disable_cancels_and_ignores_later_events() {
    let mut h = Harness::nominal();
    h.drop_tunnel();

    h.coordinator.disable();
    assert!(!h.coordinator.is_enabled());
    assert!(!h.coordinator.is_reconnection_scheduled());
    assert_eq!(h.scheduler.number_of_remaining_tasks(), 0);
    assert_eq!(h.bus.observer_count(), 0);
    assert!(!h.network.is_enabled());

    h.coordinator.on_vpn_dropped();
    h.coordinator.on_network_up();
    h.settle();
    assert!(!h.coordinator.is_reconnection_scheduled());

    // And: it can be enabled again from a clean slate
    h.coordinator.enable().unwrap();
    h.settle();
    assert_eq!(h.coordinator.retry_count(), 0);
    assert!(h.coordinator.is_reconnection_scheduled());
}

#[tokio::test]
async fn test_at_most_one_attempt_pending_under_random_events() {
    let mut h = Harness::nominal();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..500 {
        match rng.gen_range(0..8) {
            0 | 1 => h.drop_tunnel(),
            2 => h.publish(TunnelState::Connected),
            3 => h.publish(TunnelState::Disconnected),
            4 => {
                let up = rng.gen_bool(0.5);
                h.set_network(up);
            }
            5 => h.session_signal(SessionSignal::Unlocked),
            6 => h.session_signal(SessionSignal::Locked),
            _ => {
                if h.coordinator.is_reconnection_scheduled() {
                    h.fire_pending();
                }
            }
        }
        h.assert_single_pending_attempt();
        assert!(h.scheduler.number_of_remaining_tasks() <= 1);
    }
}

#[tokio::test]
async fn test_reconnects_with_real_scheduler_and_event_loop() {
    // Given: the full stack on the system clock
    let (event_loop, handle) = EventLoop::new();
    let sink = Arc::new(CollectingSink::default());
    let scheduler = Scheduler::new(
        Arc::new(SystemClock),
        handle.clone(),
        sink.clone(),
        DEFAULT_CHECK_INTERVAL,
    );
    let bus = Arc::new(TunnelStateBus::new(TunnelState::Connected));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let connector = Arc::new(RecordingConnector {
        attempts: AtomicUsize::new(0),
        notify: Some(tx),
    });
    let coordinator = ReconnectionCoordinator::new(
        scheduler.clone(),
        BackoffPolicy::default(),
        Monitors {
            vpn: VpnMonitor::new(bus.clone(), handle.clone()),
            network: NetworkMonitor::new(
                Arc::new(FixedProbe(true)),
                handle.clone(),
                Duration::from_millis(100),
            ),
            session: SessionMonitor::new(
                SessionMonitorConfig {
                    backend: SessionBackend::None,
                    assume_unlocked: true,
                },
                handle,
            ),
        },
        connector.clone(),
        sink,
    );
    tokio::spawn(event_loop.run());
    scheduler.start().unwrap();
    coordinator.enable().unwrap();

    // When: the tunnel drops
    tokio::time::sleep(Duration::from_millis(200)).await;
    bus.publish(TunnelState::Dropped(DropReason::ConnectionLost));

    // Then: a reconnect is requested within the first backoff window
    let requested = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
    assert!(matches!(requested, Ok(Some(()))), "reconnect should be requested");
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

    coordinator.disable();
    scheduler.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_immediate_attempt_requested_off_the_event_loop_is_made() {
    // Given: the full stack, with a dropped tunnel whose first attempt was made
    let (event_loop, handle) = EventLoop::new();
    let sink = Arc::new(CollectingSink::default());
    let scheduler = Scheduler::new(
        Arc::new(SystemClock),
        handle.clone(),
        sink.clone(),
        DEFAULT_CHECK_INTERVAL,
    );
    let bus = Arc::new(TunnelStateBus::new(TunnelState::Connected));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let connector = Arc::new(RecordingConnector {
        attempts: AtomicUsize::new(0),
        notify: Some(tx),
    });
    let network = NetworkMonitor::new(
        Arc::new(FixedProbe(true)),
        handle.clone(),
        Duration::from_secs(3600),
    );
    let coordinator = ReconnectionCoordinator::new(
        scheduler.clone(),
        BackoffPolicy::default(),
        Monitors {
            vpn: VpnMonitor::new(bus.clone(), handle.clone()),
            network: network.clone(),
            session: SessionMonitor::new(
                SessionMonitorConfig {
                    backend: SessionBackend::None,
                    assume_unlocked: true,
                },
                handle,
            ),
        },
        connector.clone(),
        sink.clone(),
    );
    tokio::spawn(event_loop.run());
    scheduler.start().unwrap();
    coordinator.enable().unwrap();
    network.record_reachability(true);

    bus.publish(TunnelState::Dropped(DropReason::ConnectionLost));
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
    assert!(matches!(first, Ok(Some(()))), "first attempt should be made");

    for round in 2..=20 {
        // When: an unlock is handled straight from another thread
        let handler = coordinator.clone();
        tokio::task::spawn_blocking(move || handler.on_session_unlocked())
            .await
            .unwrap();

        // Then: the zero-delay attempt it schedules is never lost
        let requested = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(
            matches!(requested, Ok(Some(()))),
            "attempt {} was scheduled but never made",
            round
        );
        assert_eq!(connector.attempts.load(Ordering::SeqCst), round);
    }

    assert!(!coordinator.is_reconnection_scheduled());
    assert!(sink.0.lock().unwrap().is_empty());

    coordinator.disable();
    scheduler.stop();
}
