//! Error types for relink
//!
//! This module defines all error types used throughout the reconnection
//! subsystem, plus the sink that scheduler and coordinator failures are
//! reported to when there is no caller left to return them to.

use crate::types::{DropReason, TaskId};
use thiserror::Error;
use tracing::error;

/// Main error type for relink
#[derive(Error, Debug)]
pub enum RelinkError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Misuse of the task scheduler
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Reconnection coordinator errors
    #[error("Reconnection error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// Network, session and tunnel monitor errors
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// A scheduled task failed while running
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Scheduler lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler was already started")]
    AlreadyStarted,

    #[error("Scheduler must be started from within a Tokio runtime")]
    NoRuntime,
}

/// Reconnection coordinator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Reconnection coordinator was already enabled")]
    AlreadyEnabled,

    #[error("Reconnection not possible: {reason}")]
    FatalDrop { reason: DropReason },
}

/// Monitor setup and probing errors
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    #[error("Reachability probe unavailable: {reason}")]
    ProbeUnavailable { reason: String },

    #[error("There are no active sessions for this seat")]
    NoActiveSession,

    #[error("Monitor must be enabled from within a Tokio runtime")]
    NoRuntime,
}

/// Failures of scheduled task actions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task {id} panicked: {message}")]
    Panicked { id: TaskId, message: String },
}

/// Destination for errors raised off the caller's stack
///
/// Scheduled actions and monitor callbacks run on the event loop, so their
/// failures are reported here instead of being returned.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &RelinkError);
}

/// Reports errors to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, err: &RelinkError) {
        error!(error = %err, "Reconnection subsystem error");
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RelinkError>;
