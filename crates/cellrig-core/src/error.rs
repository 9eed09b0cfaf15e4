//! Error types for the cellrig harness
//!
//! Every fallible operation in the harness returns [`HarnessError`]. The
//! variants follow the failure taxonomy of a test run: launching processes,
//! bringing groups up, keeping them alive, and asserting on what they do.

use std::time::Duration;
use thiserror::Error;

use crate::signal::Signal;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum HarnessError {
    // ===== Process Errors =====
    /// The executable could not be launched
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Signal delivery failed for a reason other than the process being gone
    #[error("Failed to deliver {signal} to pid {pid}: {reason}")]
    Signal {
        pid: u32,
        signal: Signal,
        reason: String,
    },

    // ===== Group Errors =====
    /// A group member did not become ready in time
    #[error("Member `{member}` not ready after {}: {reason}", fmt_duration(.timeout))]
    ReadinessTimeout {
        member: String,
        timeout: Duration,
        reason: String,
    },

    /// A running member exited without being asked to
    #[error("Member `{member}` exited unexpectedly with code {code}")]
    MemberFault { member: String, code: i32 },

    // ===== Assertion Errors =====
    /// `eventually` ran out of time
    #[error(
        "Timed out after {}: expected {description}\n  {explanation}\n  last observed: {last_value}",
        fmt_duration(.elapsed)
    )]
    AssertionTimeout {
        description: String,
        last_value: String,
        explanation: String,
        elapsed: Duration,
    },

    /// `consistently` saw a sample that did not match
    #[error(
        "Violated after {}: expected {description}\n  {explanation}\n  observed: {value}",
        fmt_duration(.elapsed)
    )]
    AssertionViolation {
        description: String,
        value: String,
        explanation: String,
        elapsed: Duration,
    },

    /// The observed target closed before it could match
    #[error(
        "Closed after {}: expected {description}\n  {explanation}\n  last observed: {last_value}",
        fmt_duration(.elapsed)
    )]
    DetectionClosed {
        description: String,
        last_value: String,
        explanation: String,
        elapsed: Duration,
    },

    /// The observation itself failed
    #[error("Observation failed after {}: {reason}", fmt_duration(.elapsed))]
    ObservationFailed { reason: String, elapsed: Duration },

    // ===== Buffer Errors =====
    /// Write to a buffer that has already been closed
    #[error("Attempted to write to a closed buffer")]
    BufferClosed,

    /// Pattern failed to compile
    #[error("Invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // ===== General Errors =====
    /// A bounded wait expired
    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarnessError {
    /// Build a [`HarnessError::Timeout`] from a duration
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        HarnessError::Timeout {
            operation: operation.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Whether this error came out of the polling assertion engine
    pub fn is_assertion_failure(&self) -> bool {
        matches!(
            self,
            HarnessError::AssertionTimeout { .. }
                | HarnessError::AssertionViolation { .. }
                | HarnessError::DetectionClosed { .. }
                | HarnessError::ObservationFailed { .. }
        )
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::Config(err.to_string())
    }
}

fn fmt_duration(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;
