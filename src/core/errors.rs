/*!
 * Error Types
 * Centralized error handling with thiserror and serde support
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synchronizer-related errors with serialization support
///
/// Timeouts are not errors: timed acquires report expiry through their
/// boolean result.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum SyncError {
    /// The thread's interrupt flag was observed during a blocking wait.
    #[error("Wait interrupted")]
    Interrupted,

    /// A release or condition operation was attempted by a thread that
    /// does not hold the synchronizer exclusively.
    #[error("Illegal monitor state: {0}")]
    IllegalMonitorState(String),

    /// The state interpreter does not implement the invoked hook.
    #[error("Operation not supported by this synchronizer: {0}")]
    Unsupported(String),
}

/// Scheduler-related errors with serialization support
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum ScheduleError {
    /// Submission after shutdown.
    #[error("Task rejected: {0}")]
    Rejected(String),

    /// Non-positive period or delay for a periodic constructor.
    #[error("Period must be positive, got {0} ns")]
    InvalidPeriod(i64),

    /// The task was cancelled before producing a result.
    #[error("Task cancelled")]
    Cancelled,

    /// The task payload panicked.
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// A blocking wait on a task result was interrupted.
    #[error("Wait interrupted")]
    Interrupted,
}

impl SyncError {
    /// Unimplemented-hook error, named after the missing hook.
    pub fn unsupported(hook: &str) -> Self {
        SyncError::Unsupported(hook.to_string())
    }
}

impl From<SyncError> for ScheduleError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Interrupted => ScheduleError::Interrupted,
            other => ScheduleError::Rejected(other.to_string()),
        }
    }
}

/// Result type for synchronizer operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Result type for scheduler operations
pub type ScheduleResult<T> = std::result::Result<T, ScheduleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_serialization() {
        let error = SyncError::IllegalMonitorState("not owner".to_string());
        let json = serde_json::to_string(&error).unwrap();
        let deserialized: SyncError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, deserialized);
    }

    #[test]
    fn test_schedule_error_serialization() {
        let error = ScheduleError::InvalidPeriod(0);
        let json = serde_json::to_string(&error).unwrap();
        let deserialized: ScheduleError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, deserialized);
    }

    #[test]
    fn test_schedule_error_from_interrupt() {
        let err: ScheduleError = SyncError::Interrupted.into();
        assert_eq!(err, ScheduleError::Interrupted);
    }

    #[test]
    fn test_error_display() {
        let error = ScheduleError::Rejected("executor shut down".to_string());
        assert_eq!(error.to_string(), "Task rejected: executor shut down");
    }
}
