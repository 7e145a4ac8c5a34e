//! Unit tests for error types and conversions

use relink_core::error::{
    ConfigError, CoordinatorError, MonitorError, RelinkError, SchedulerError,
};
use relink_core::types::DropReason;

#[test]
fn test_config_error_display() {
    let error = ConfigError::ValidationError {
        message: "bad interval".to_string(),
    };
    assert_eq!(
        error.to_string(),
        "Configuration validation error: bad interval"
    );
}

#[test]
fn test_scheduler_error_display() {
    assert_eq!(
        SchedulerError::AlreadyStarted.to_string(),
        "Scheduler was already started"
    );
}

#[test]
fn test_fatal_drop_display() {
    let error = CoordinatorError::FatalDrop {
        reason: DropReason::MaximumSessionsReached,
    };
    assert_eq!(
        error.to_string(),
        "Reconnection not possible: maximum sessions reached"
    );
}

#[test]
fn test_monitor_error_display() {
    let error = MonitorError::ProbeUnavailable {
        reason: "`ip` not found".to_string(),
    };
    assert_eq!(
        error.to_string(),
        "Reachability probe unavailable: `ip` not found"
    );
}

#[test]
fn test_relink_error_from_variants() {
    let error: RelinkError = SchedulerError::NoRuntime.into();
    assert!(matches!(error, RelinkError::Scheduler(_)));

    let error: RelinkError = CoordinatorError::AlreadyEnabled.into();
    assert!(matches!(error, RelinkError::Coordinator(_)));
    assert_eq!(
        error.to_string(),
        "Reconnection error: Reconnection coordinator was already enabled"
    );

    let error: RelinkError = MonitorError::NoActiveSession.into();
    assert!(matches!(error, RelinkError::Monitor(_)));

    let error: RelinkError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
    assert!(matches!(error, RelinkError::Io(_)));
}
