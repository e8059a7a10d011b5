//! Tuning constants for every component, grouped by owner.
//!
//! Centralizing these here mirrors keeping wire-protocol parameters in one
//! module: call sites read a named constant instead of a bare literal, and a
//! single place documents the numbers this crate was built against.

use std::time::Duration;

// --- 4.A Process Runner -----------------------------------------------

/// Grace period between sending terminate and sending kill to a child's
/// process group when a deadline or cancellation fires.
pub const PROCESS_KILL_GRACE: Duration = Duration::from_millis(600);

// --- 4.D Unmount Service ------------------------------------------------

pub const TOTAL_UNMOUNT_TIMEOUT: Duration = Duration::from_secs(10);
pub const UNMOUNT_ROUND_MAX: u32 = 4;
pub const UNMOUNT_STEP_CLAMP: Duration = Duration::from_secs(3);
pub const UNMOUNT_MIN_REMAINING_TO_START: Duration = Duration::from_millis(500);

// --- 4.E Mount Manager ---------------------------------------------------

pub const SSHFS_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const MOUNT_POLL_TIMEOUT: Duration = Duration::from_secs(5);
pub const RESPONSIVENESS_PROBE_TIMEOUT: Duration = Duration::from_millis(1_500);
pub const MAX_PRESERVE_MISSES: u32 = 2;
pub const CONNECTING_MIN_VISIBLE: Duration = Duration::from_millis(800);
pub const DISCONNECTING_MIN_VISIBLE: Duration = Duration::from_millis(700);
pub const FORCE_STOP_SIGNAL_GAP: Duration = Duration::from_millis(300);
pub const BUSY_PRECHECK_WAIT: Duration = Duration::from_millis(800);

/// Substrings in a failed sshfs attempt's combined output that make the
/// Mount Manager retry once after cleanup, per the connect contract.
pub const TRANSIENT_RETRY_NEEDLES: &[&str] = &[
    "resource busy",
    "transport endpoint",
    "operation timed out",
    "connection reset",
    "connection closed",
    "broken pipe",
    "network is unreachable",
    "no route to host",
];

// --- 4.F Directory Browser Sessions --------------------------------------

pub const BREAKER_FAILURE_THRESHOLD: u32 = 8;
pub const BREAKER_WINDOW: Duration = Duration::from_secs(30);
pub const DIRECTORY_CACHE_CAPACITY: u64 = 256;
pub const DIRECTORY_CACHE_TTL: Duration = Duration::from_secs(20);

// --- 4.G Operations Engine ------------------------------------------------

pub const GLOBAL_MAX_CONCURRENT_DEFAULT: usize = 4;
pub const STALLED_REPLACE_THRESHOLD: Duration = Duration::from_secs(20);

pub const CONNECT_OP_TIMEOUT: Duration = Duration::from_secs(45);
pub const DISCONNECT_OP_TIMEOUT: Duration = Duration::from_secs(10);
pub const REFRESH_OP_TIMEOUT: Duration = Duration::from_secs(18);

pub fn op_timeout(intent: crate::model::OperationIntent) -> Duration {
    use crate::model::OperationIntent::*;
    match intent {
        Connect => CONNECT_OP_TIMEOUT,
        Disconnect => DISCONNECT_OP_TIMEOUT,
        Refresh => REFRESH_OP_TIMEOUT,
        Test => CONNECT_OP_TIMEOUT,
    }
}

// --- 4.H Recovery Controller ----------------------------------------------

pub const PERIODIC_RECOVERY_INTERVAL_DEFAULT: Duration = Duration::from_secs(15);
pub const HEALTHY_PROBE_INTERVAL: Duration = Duration::from_secs(60);
pub const NETWORK_DEBOUNCE: Duration = Duration::from_millis(1_500);

pub const WAKE_BURST_OFFSETS: &[Duration] = &[
    Duration::from_secs(0),
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(8),
];
pub const NETWORK_BURST_OFFSETS: &[Duration] = &[
    Duration::from_secs(0),
    Duration::from_secs(2),
    Duration::from_secs(6),
];

/// Backoff tables, seconds, indexed by `min(attempt, len - 1)`.
pub const WAKE_TRANSIENT_BACKOFF: &[u64] = &[0, 1, 2, 4, 8, 15, 30, 45, 60];
pub const WAKE_NONTRANSIENT_BACKOFF: &[u64] = &[0, 2, 5, 10, 20, 30, 45, 60];
pub const VOLUME_TRANSIENT_BACKOFF: &[u64] = &[0, 1, 2, 4, 8, 15, 30];
pub const VOLUME_NONTRANSIENT_BACKOFF: &[u64] = &[0, 2, 5, 10, 20, 30];

pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Required consecutive strikes before auto-reconnect is scheduled, keyed by
/// what triggered the recovery pass that observed the strike.
pub fn required_strikes(trigger: crate::model::RecoveryPassTrigger) -> u32 {
    use crate::model::RecoveryPassTrigger::*;
    match trigger {
        Wake | NetworkRestored => 1,
        Periodic => 2,
        Other => 1,
    }
}

// --- 4.J Diagnostics -------------------------------------------------------

pub const DIAGNOSTICS_RING_CAPACITY: usize = 400;
