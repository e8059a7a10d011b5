//! External collaborators this crate depends on by reference. Concrete
//! implementations (a file-backed store, Keychain access, `IOKit`/
//! `NWPathMonitor` signal bridging) live outside this crate per the
//! Non-goals; this module defines the seams.

use crate::error::CoreError;
use crate::model::RemoteConfig;
use crate::util::BoxFuture;

/// Owns the persisted list of remotes. Storage format is opaque to this
/// crate.
pub trait RemoteStore: Send + Sync {
    fn load<'a>(&'a self) -> BoxFuture<'a, Result<Vec<RemoteConfig>, CoreError>>;
    fn upsert<'a>(&'a self, remote: RemoteConfig) -> BoxFuture<'a, Result<(), CoreError>>;
    fn delete<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, Result<(), CoreError>>;
}

/// Backing secret store (Keychain or equivalent). `read` may prompt the user
/// when `allow_user_interaction` is set; normal background flows pass
/// `false`.
pub trait SecretStore: Send + Sync {
    fn save<'a>(&'a self, remote_id: &'a str, secret: &'a str) -> BoxFuture<'a, Result<(), CoreError>>;
    fn read<'a>(&'a self, remote_id: &'a str, allow_user_interaction: bool) -> BoxFuture<'a, Result<Option<String>, CoreError>>;
    fn delete<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, Result<(), CoreError>>;
}

/// Result of a dependency check (is `sshfs`/macFUSE installed and usable?).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStatus {
    pub is_ready: bool,
    pub discovered_path: Option<String>,
    pub issues: Vec<String>,
}

pub trait DependencyChecker: Send + Sync {
    fn check<'a>(&'a self) -> BoxFuture<'a, DependencyStatus>;
}
