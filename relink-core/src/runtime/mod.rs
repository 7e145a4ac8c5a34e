//! Execution context shared by the scheduler, monitors and coordinator
//!
//! All reconnection state is mutated from a single [`EventLoop`]; the
//! [`Clock`] gives the scheduler wall-clock time that keeps advancing while
//! the machine is suspended.

pub mod clock;
pub mod event_loop;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event_loop::{EventLoop, EventLoopHandle, Job};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Zero-argument callback slot used by the monitors
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
