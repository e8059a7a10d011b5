//! Data model shared by every component.
//!
//! Pure, serializable value types only; task handles and other runtime-only
//! fields live next to these types in their owning module, not inside them,
//! so this module stays `Serialize`/`Deserialize` end to end.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Stable identifier for a configured remote. Opaque to this crate.
pub type RemoteId = String;

/// How a remote authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    Password,
    PrivateKey,
}

/// External, read-only configuration for one remote. Owned by the
/// persistence collaborator; this crate holds a read-mostly snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub id: RemoteId,
    pub display_name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub remote_dir: String,
    pub local_mount_path: String,
    pub auth_mode: AuthMode,
    pub private_key_path: Option<String>,
    pub auto_connect_on_launch: bool,
    pub favorite_paths: Vec<String>,
    pub recent_paths: Vec<String>,
}

impl RemoteConfig {
    /// `user@host:remote-dir`, used both to build the sshfs argument vector
    /// and as a needle when scanning `ps` output for helper processes.
    pub fn source_spec(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.remote_dir)
    }
}

/// Connection lifecycle for a single remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Observable status for one remote.
///
/// Invariants: `state == Connected` implies `mounted_path.is_some()`;
/// `state == Disconnected` implies `mounted_path.is_none()`;
/// `state == Error` implies `last_error.is_some()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub state: ConnectionState,
    pub mounted_path: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: SystemTime,
}

impl RemoteStatus {
    pub fn disconnected() -> Self {
        Self { state: ConnectionState::Disconnected, mounted_path: None, last_error: None, updated_at: SystemTime::now() }
    }

    pub fn connecting() -> Self {
        Self { state: ConnectionState::Connecting, mounted_path: None, last_error: None, updated_at: SystemTime::now() }
    }

    pub fn connected(mounted_path: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Connected,
            mounted_path: Some(mounted_path.into()),
            last_error: None,
            updated_at: SystemTime::now(),
        }
    }

    pub fn disconnecting() -> Self {
        Self { state: ConnectionState::Disconnecting, mounted_path: None, last_error: None, updated_at: SystemTime::now() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { state: ConnectionState::Error, mounted_path: None, last_error: Some(message.into()), updated_at: SystemTime::now() }
    }

    /// Invariants hold by construction via the helpers above; this re-checks
    /// them, used by tests and by the control actor before publishing.
    pub fn check_invariants(&self) -> bool {
        match self.state {
            ConnectionState::Connected => self.mounted_path.is_some(),
            ConnectionState::Disconnected => self.mounted_path.is_none(),
            ConnectionState::Error => self.last_error.is_some(),
            _ => true,
        }
    }
}

/// One parsed row of the system mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub source: String,
    pub mount_point: String,
    pub fs_type: String,
}

/// What an admitted operation is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationIntent {
    Connect,
    Disconnect,
    Refresh,
    Test,
}

/// What caused an operation to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationTrigger {
    Manual,
    Recovery,
    Startup,
    Termination,
}

/// What caused a Recovery Controller pass to run. Distinct from
/// `OperationTrigger`: this classifies the pass, `required_strikes` and the
/// backoff tables are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPassTrigger {
    Wake,
    NetworkRestored,
    Periodic,
    Other,
}

/// How a new request for a remote that already has an active operation is
/// handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    LatestIntentWins,
    SkipIfBusy,
}

/// Directory-browser health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrowserHealth {
    Connecting,
    Healthy,
    Degraded,
    Reconnecting,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserConnectionHealth {
    pub state: BrowserHealth,
    pub last_success_at: Option<SystemTime>,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl BrowserConnectionHealth {
    pub fn new() -> Self {
        Self { state: BrowserHealth::Connecting, last_success_at: None, last_latency_ms: None, last_error: None }
    }
}

impl Default for BrowserConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// One directory entry returned by a browser session listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub full_path: String,
    pub modified_at: Option<SystemTime>,
}

/// Result of a single browser `list`/`go_up`/`retry_current` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserSnapshot {
    pub request_id: u64,
    pub path: String,
    pub entries: Vec<DirEntry>,
    pub health: BrowserHealth,
    pub is_stale: bool,
    pub is_confirmed_empty: bool,
    pub message: Option<String>,
    pub latency_ms: u64,
    pub from_cache: bool,
}

/// Emitted while there is active recovery work in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryIndicator {
    pub reason: String,
    pub started_at: SystemTime,
    pub pending_remote_count: usize,
    pub scheduled_reconnect_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub timestamp: SystemTime,
    pub level: DiagnosticLevel,
    pub category: String,
    pub message: String,
}
