//! Unified error taxonomy for the connection-management core.
//!
//! Every fallible operation in this crate returns [`CoreError`]. Component-local
//! errors are converted into it at the boundary of the component that owns the
//! corresponding contract (mount manager, unmount service, and so on).

use thiserror::Error;

/// A blocking process reported by `lsof` while unmounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocker {
    pub command: String,
    pub pid: i32,
}

impl std::fmt::Display for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.command, self.pid)
    }
}

/// The unified error type surfaced by every public operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// Inputs violate constraints (path not absolute, port out of range,
    /// conflicting mount point).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A helper binary is absent or unusable.
    #[error("dependency unavailable: {0}")]
    DependencyMissing(String),

    /// A child process exited non-zero. Carries sanitized combined output.
    #[error("process failed (exit {exit_code:?}): {detail}")]
    ProcessFailure { exit_code: Option<i32>, detail: String },

    /// An inner command, operation watchdog, or global deadline expired.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The mount point is in use by another process.
    #[error("mount point busy: {0:?}")]
    Busy(Vec<Blocker>),

    /// Authentication failed, or the error is otherwise permanent and should
    /// suspend auto-reconnect (missing/locked key material, macFUSE-on-FUSE,
    /// shared mount point).
    #[error("permanent failure: {0}")]
    PermanentFailure(String),

    /// A transport-level error eligible for retry and aggressive backoff
    /// (reset, timeout, unreachable, broken pipe, and similar).
    #[error("transient error: {0}")]
    Transient(String),

    /// The caller, a supersession, or shutdown cancelled the operation.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn dependency_missing(msg: impl Into<String>) -> Self {
        Self::DependencyMissing(msg.into())
    }

    pub fn process_failure(exit_code: Option<i32>, detail: impl Into<String>) -> Self {
        Self::ProcessFailure { exit_code, detail: detail.into() }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// True for errors eligible for retry and aggressive wake backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// True for errors that should stop auto-reconnect for the remote.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentFailure(_))
    }

    pub fn stops_auto_reconnect(&self) -> bool {
        self.is_permanent()
    }

    /// Short, user-facing message suitable for `RemoteStatus.last_error`.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Classify a sanitized stderr/stdout blob from an external tool, per the
    /// message-substring table in the Mount Manager contract.
    pub fn classify_process_message(exit_code: Option<i32>, combined_output: &str) -> Self {
        let lower = combined_output.to_ascii_lowercase();
        const TRANSIENT_NEEDLES: &[&str] = &[
            "resource busy",
            "transport endpoint",
            "operation timed out",
            "connection reset",
            "connection closed",
            "broken pipe",
            "network is unreachable",
            "no route to host",
        ];
        if TRANSIENT_NEEDLES.iter().any(|n| lower.contains(n)) {
            return Self::Transient(combined_output.to_string());
        }
        if lower.contains("permission denied") {
            return Self::PermanentFailure(format!("permission denied for root path: {combined_output}"));
        }
        if lower.contains("authentication failed") || lower.contains("auth fail") {
            return Self::PermanentFailure(format!("authentication failed: {combined_output}"));
        }
        Self::ProcessFailure { exit_code, detail: combined_output.to_string() }
    }
}
