//! Suspend-aware task scheduler
//!
//! Relative timers (`tokio::time::sleep`) run on the monotonic clock, which
//! stops while the machine is suspended: a task due "in 5 seconds" would fire
//! 5 seconds after resume no matter how long the machine slept. The
//! [`Scheduler`] instead records the absolute wall-clock time each task is
//! due and wakes up at least every `check_interval` to compare it against
//! [`Clock::now`], so an overdue task fires once, right after resume.
//!
//! Ready actions are never run on the wakeup task itself; they are posted to
//! the [`EventLoop`](crate::runtime::EventLoop).

use crate::error::{ErrorSink, RelinkError, SchedulerError, TaskError};
use crate::runtime::event_loop::panic_message;
use crate::runtime::{lock, Clock, EventLoopHandle};
use crate::types::TaskId;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on the time between two wakeups
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Work to run once a task is due
pub type Action = Box<dyn FnOnce() + Send + 'static>;

struct ScheduledTask {
    id: TaskId,
    fire_at: SystemTime,
    action: Action,
}

#[derive(Default)]
struct SchedulerState {
    last_task_id: u64,
    pending: HashMap<TaskId, ScheduledTask>,
    /// Set iff the scheduler is running
    next_wakeup: Option<SystemTime>,
    wakeup_handle: Option<JoinHandle<()>>,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    rearm: Arc<Notify>,
    clock: Arc<dyn Clock>,
    event_loop: EventLoopHandle,
    error_sink: Arc<dyn ErrorSink>,
    check_interval: Duration,
}

/// Runs actions at absolute wall-clock timestamps
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        event_loop: EventLoopHandle,
        error_sink: Arc<dyn ErrorSink>,
        check_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(SchedulerState::default()),
                rearm: Arc::new(Notify::new()),
                clock,
                event_loop,
                error_sink,
                check_interval,
            }),
        }
    }

    /// Arm the first wakeup and spawn the wakeup task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let mut state = lock(&self.shared.state);
        if state.next_wakeup.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let now = self.shared.clock.now();
        state.next_wakeup = Some(self.shared.compute_next_wakeup(now, &state.pending));
        state.wakeup_handle = Some(runtime.spawn(wakeup_loop(
            Arc::downgrade(&self.shared),
            Arc::clone(&self.shared.rearm),
        )));

        info!(
            check_interval_secs = self.shared.check_interval.as_secs(),
            pending = state.pending.len(),
            "Scheduler started"
        );
        Ok(())
    }

    /// Disarm the wakeup and discard every pending task without running it
    pub fn stop(&self) {
        let discarded: Vec<ScheduledTask> = {
            let mut state = lock(&self.shared.state);
            if let Some(handle) = state.wakeup_handle.take() {
                handle.abort();
            }
            state.next_wakeup = None;
            state.pending.drain().map(|(_, task)| task).collect()
        };

        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), "Scheduler stopped, pending tasks discarded");
        }
    }

    /// Run `action` once `delay` has elapsed in wall-clock time
    pub fn run_after<F>(&self, delay: Duration, action: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let now = self.shared.clock.now();
        self.run_at(saturating_add(now, delay), action)
    }

    /// Run `action` at `timestamp`
    ///
    /// If the scheduler is running and `timestamp` is earlier than the armed
    /// wakeup, the wakeup is moved forward right away.
    pub fn run_at<F>(&self, timestamp: SystemTime, action: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = lock(&self.shared.state);
        state.last_task_id += 1;
        let id = TaskId::new(state.last_task_id);
        state.pending.insert(
            id,
            ScheduledTask {
                id,
                fire_at: timestamp,
                action: Box::new(action),
            },
        );

        let rearm = match state.next_wakeup {
            Some(next_wakeup) if timestamp < next_wakeup => {
                let now = self.shared.clock.now();
                state.next_wakeup = Some(timestamp.max(now));
                true
            }
            _ => false,
        };
        drop(state);

        if rearm {
            debug!(task = %id, "Wakeup moved earlier for new task");
            self.shared.rearm.notify_one();
        }
        id
    }

    /// Remove a pending task; returns whether it was still pending
    pub fn cancel_task(&self, id: TaskId) -> bool {
        let removed = lock(&self.shared.state).pending.remove(&id);
        removed.is_some()
    }

    /// Hand every due task to the event loop
    ///
    /// This is what each wakeup does; it is public so that callers driving
    /// time by hand can tick the scheduler themselves. Returns the number of
    /// tasks dispatched.
    pub fn run_tasks_ready_to_fire(&self) -> usize {
        self.shared.run_tasks_ready_to_fire()
    }

    pub fn is_started(&self) -> bool {
        lock(&self.shared.state).next_wakeup.is_some()
    }

    pub fn number_of_remaining_tasks(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    /// When the wakeup task will next look at the pending tasks
    pub fn next_wakeup(&self) -> Option<SystemTime> {
        lock(&self.shared.state).next_wakeup
    }

    /// Due time of a pending task
    pub fn fire_time(&self, id: TaskId) -> Option<SystemTime> {
        lock(&self.shared.state).pending.get(&id).map(|task| task.fire_at)
    }

    /// Current time according to the scheduler's clock
    pub fn now(&self) -> SystemTime {
        self.shared.clock.now()
    }
}

impl SchedulerShared {
    fn compute_next_wakeup(
        &self,
        now: SystemTime,
        pending: &HashMap<TaskId, ScheduledTask>,
    ) -> SystemTime {
        let periodic = saturating_add(now, self.check_interval);
        let earliest = pending.values().map(|task| task.fire_at).min();
        match earliest {
            Some(fire_at) => fire_at.min(periodic).max(now),
            None => periodic,
        }
    }

    /// Time left before the armed wakeup, `None` once stopped
    fn time_until_next_wakeup(&self) -> Option<Duration> {
        let next_wakeup = lock(&self.state).next_wakeup?;
        Some(
            next_wakeup
                .duration_since(self.clock.now())
                .unwrap_or(Duration::ZERO),
        )
    }

    fn run_tasks_ready_to_fire(&self) -> usize {
        let now = self.clock.now();
        let mut ready: Vec<ScheduledTask> = {
            let mut state = lock(&self.state);
            let due: Vec<TaskId> = state
                .pending
                .values()
                .filter(|task| task.fire_at <= now)
                .map(|task| task.id)
                .collect();
            let ready = due
                .into_iter()
                .filter_map(|id| state.pending.remove(&id))
                .collect();
            if state.next_wakeup.is_some() {
                state.next_wakeup = Some(self.compute_next_wakeup(now, &state.pending));
            }
            ready
        };
        ready.sort_by_key(|task| (task.fire_at, task.id));

        let count = ready.len();
        for task in ready {
            self.dispatch(task);
        }
        count
    }

    fn dispatch(&self, task: ScheduledTask) {
        let ScheduledTask { id, action, .. } = task;
        let sink = Arc::clone(&self.error_sink);
        let posted = self.event_loop.post(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
                let err = RelinkError::Task(TaskError::Panicked {
                    id,
                    message: panic_message(payload.as_ref()),
                });
                sink.report(&err);
            }
        });
        if !posted {
            warn!(task = %id, "Event loop is gone, scheduled task dropped");
        }
    }
}

/// Sleeps until the armed wakeup, holding the scheduler only while awake
async fn wakeup_loop(shared: Weak<SchedulerShared>, rearm: Arc<Notify>) {
    loop {
        let Some(wait) = shared
            .upgrade()
            .and_then(|scheduler| scheduler.time_until_next_wakeup())
        else {
            return;
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                let Some(scheduler) = shared.upgrade() else {
                    return;
                };
                scheduler.run_tasks_ready_to_fire();
            }
            _ = rearm.notified() => {}
        }
    }
}

fn saturating_add(time: SystemTime, delay: Duration) -> SystemTime {
    time.checked_add(delay)
        .unwrap_or_else(|| time + Duration::from_secs(u64::from(u32::MAX)))
}
