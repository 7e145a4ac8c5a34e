//! Single-worker job queue
//!
//! Jobs posted through an [`EventLoopHandle`] run one at a time, to
//! completion, in the order they were posted. Code that only runs as a job
//! never races with other jobs, which is what the reconnection coordinator
//! relies on for its invariants.

use std::panic::{self, AssertUnwindSafe};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Unit of work executed on the event loop
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Receiving side of the job queue
pub struct EventLoop {
    rx: mpsc::UnboundedReceiver<Job>,
}

/// Cloneable handle used to post jobs onto the event loop
#[derive(Clone)]
pub struct EventLoopHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl EventLoop {
    /// Create an event loop and the first handle to it
    pub fn new() -> (Self, EventLoopHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, EventLoopHandle { tx })
    }

    /// Drain jobs until every handle has been dropped
    pub async fn run(mut self) {
        debug!("Event loop started");
        while let Some(job) = self.rx.recv().await {
            run_job(job);
        }
        debug!("Event loop finished: all handles dropped");
    }

    /// Run every job queued so far, including jobs those jobs post
    ///
    /// Returns the number of jobs executed.
    pub fn run_until_idle(&mut self) -> usize {
        let mut executed = 0;
        while let Ok(job) = self.rx.try_recv() {
            run_job(job);
            executed += 1;
        }
        executed
    }
}

impl EventLoopHandle {
    /// Queue a job; returns `false` if the event loop is gone
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            debug!("Event loop closed, dropping job");
            return false;
        }
        true
    }
}

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!(panic = %panic_message(payload.as_ref()), "Event loop job panicked");
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
