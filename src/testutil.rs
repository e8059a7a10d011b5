//! Test doubles shared across module test suites. `#[cfg(test)]`-only:
//! never compiled into a release build.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::browser::{BoxFuture, DirectoryTransport, DirectoryTransportFactory};
use crate::error::CoreError;
use crate::model::{DirEntry, RemoteConfig};
use crate::process::{ProcessExecutor, ProcessOutput};
use crate::traits::SecretStore;

fn ok_output(stdout: impl Into<String>) -> ProcessOutput {
    ProcessOutput { exit_code: Some(0), stdout: stdout.into(), stderr: String::new(), timed_out: false, duration: Duration::from_millis(1) }
}

/// Executor that replays a fixed queue of responses keyed by executable
/// name. Once a queue is exhausted, falls back to a registered `sticky`
/// response for that executable (if any), then to an empty success.
pub struct FakeProcessExecutor {
    queues: Mutex<HashMap<String, VecDeque<Result<ProcessOutput, CoreError>>>>,
    sticky: Mutex<HashMap<String, ProcessOutput>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeProcessExecutor {
    pub fn new() -> Self {
        Self { queues: Mutex::new(HashMap::new()), sticky: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) }
    }

    pub fn push(&self, executable: &str, output: ProcessOutput) {
        self.queues.lock().unwrap().entry(executable.to_string()).or_default().push_back(Ok(output));
    }

    pub fn push_err(&self, executable: &str, err: CoreError) {
        self.queues.lock().unwrap().entry(executable.to_string()).or_default().push_back(Err(err));
    }

    pub fn push_ok_stdout(&self, executable: &str, stdout: impl Into<String>) {
        self.push(executable, ok_output(stdout));
    }

    /// Response returned for every subsequent call to `executable` once its
    /// one-shot queue is empty, until replaced or the executor is dropped.
    pub fn set_sticky_stdout(&self, executable: &str, stdout: impl Into<String>) {
        self.sticky.lock().unwrap().insert(executable.to_string(), ok_output(stdout));
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for FakeProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor for FakeProcessExecutor {
    fn run<'a>(
        &'a self,
        executable: &'a str,
        args: &'a [String],
        _env_overrides: &'a [(String, String)],
        _timeout: Duration,
        _stdin_data: Option<&'a [u8]>,
        _cancel: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> BoxFuture<'a, Result<ProcessOutput, CoreError>> {
        self.calls.lock().unwrap().push((executable.to_string(), args.to_vec()));
        let next = self.queues.lock().unwrap().get_mut(executable).and_then(|q| q.pop_front());
        let sticky = self.sticky.lock().unwrap().get(executable).cloned();
        Box::pin(async move { next.unwrap_or_else(|| Ok(sticky.unwrap_or_else(|| ok_output("")))) })
    }
}

/// In-memory directory transport. `fail_next` queues a one-shot error for
/// the next `list_directory` call; after it fires the transport reverts to
/// returning `entries` for every path.
pub struct FakeDirectoryTransport {
    entries: Vec<DirEntry>,
    next_error: Mutex<Option<CoreError>>,
}

impl FakeDirectoryTransport {
    pub fn with_entries(named: Vec<(&str, &str)>) -> Self {
        let entries = named
            .into_iter()
            .map(|(name, full_path)| DirEntry { name: name.to_string(), full_path: full_path.to_string(), modified_at: None })
            .collect();
        Self { entries, next_error: Mutex::new(None) }
    }

    pub fn fail_next(&self, err: CoreError) {
        *self.next_error.lock().unwrap() = Some(err);
    }
}

impl DirectoryTransport for FakeDirectoryTransport {
    fn list_directory<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<Vec<DirEntry>, CoreError>> {
        let queued = self.next_error.lock().unwrap().take();
        let entries = self.entries.clone();
        Box::pin(async move {
            match queued {
                Some(err) => Err(err),
                None => Ok(entries),
            }
        })
    }
}

/// Opens a [`FakeDirectoryTransport`] with a fixed set of entries for every
/// session, regardless of which remote or password is supplied.
#[derive(Default)]
pub struct FakeTransportFactory {
    entries: Vec<(&'static str, &'static str)>,
}

impl FakeTransportFactory {
    pub fn with_entries(entries: Vec<(&'static str, &'static str)>) -> Self {
        Self { entries }
    }
}

impl DirectoryTransportFactory for FakeTransportFactory {
    fn open<'a>(&'a self, _remote: &'a RemoteConfig, _password: Option<&'a str>) -> BoxFuture<'a, Result<Arc<dyn DirectoryTransport>, CoreError>> {
        let entries = self.entries.clone();
        Box::pin(async move {
            let transport: Arc<dyn DirectoryTransport> = Arc::new(FakeDirectoryTransport::with_entries(entries));
            Ok(transport)
        })
    }
}

/// In-memory secret store recording read counts and the interactive flag
/// passed on the most recent read, for assertions on caller behavior.
pub struct FakeSecretStore {
    values: Mutex<HashMap<String, String>>,
    read_counts: Mutex<HashMap<String, u32>>,
    last_interactive: Mutex<HashMap<String, bool>>,
}

impl FakeSecretStore {
    pub fn new() -> Self {
        Self { values: Mutex::new(HashMap::new()), read_counts: Mutex::new(HashMap::new()), last_interactive: Mutex::new(HashMap::new()) }
    }

    pub fn set(&self, remote_id: &str, secret: &str) {
        self.values.lock().unwrap().insert(remote_id.to_string(), secret.to_string());
    }

    pub fn read_count(&self, remote_id: &str) -> u32 {
        *self.read_counts.lock().unwrap().get(remote_id).unwrap_or(&0)
    }

    pub fn last_interactive_flag(&self, remote_id: &str) -> Option<bool> {
        self.last_interactive.lock().unwrap().get(remote_id).copied()
    }
}

impl Default for FakeSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for FakeSecretStore {
    fn save<'a>(&'a self, remote_id: &'a str, secret: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        self.values.lock().unwrap().insert(remote_id.to_string(), secret.to_string());
        Box::pin(async { Ok(()) })
    }

    fn read<'a>(&'a self, remote_id: &'a str, allow_user_interaction: bool) -> BoxFuture<'a, Result<Option<String>, CoreError>> {
        *self.read_counts.lock().unwrap().entry(remote_id.to_string()).or_insert(0) += 1;
        self.last_interactive.lock().unwrap().insert(remote_id.to_string(), allow_user_interaction);
        let value = self.values.lock().unwrap().get(remote_id).cloned();
        Box::pin(async move { Ok(value) })
    }

    fn delete<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        self.values.lock().unwrap().remove(remote_id);
        Box::pin(async { Ok(()) })
    }
}

/// Persisted-remotes double for [`crate::traits::RemoteStore`], used by
/// `core.rs` and `recovery.rs` tests.
pub struct FakeRemoteStore {
    remotes: Mutex<HashMap<String, RemoteConfig>>,
}

impl FakeRemoteStore {
    pub fn new(initial: Vec<RemoteConfig>) -> Self {
        Self { remotes: Mutex::new(initial.into_iter().map(|r| (r.id.clone(), r)).collect()) }
    }
}

impl crate::traits::RemoteStore for FakeRemoteStore {
    fn load<'a>(&'a self) -> BoxFuture<'a, Result<Vec<RemoteConfig>, CoreError>> {
        let remotes: Vec<RemoteConfig> = self.remotes.lock().unwrap().values().cloned().collect();
        Box::pin(async move { Ok(remotes) })
    }

    fn upsert<'a>(&'a self, remote: RemoteConfig) -> BoxFuture<'a, Result<(), CoreError>> {
        self.remotes.lock().unwrap().insert(remote.id.clone(), remote);
        Box::pin(async { Ok(()) })
    }

    fn delete<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        self.remotes.lock().unwrap().remove(remote_id);
        Box::pin(async { Ok(()) })
    }
}

/// Dependency checker double that always reports ready, for `core.rs`
/// construction in tests.
pub struct FakeDependencyChecker {
    pub ready: bool,
}

impl FakeDependencyChecker {
    pub fn ready() -> Self {
        Self { ready: true }
    }
}

impl crate::traits::DependencyChecker for FakeDependencyChecker {
    fn check<'a>(&'a self) -> BoxFuture<'a, crate::traits::DependencyStatus> {
        let ready = self.ready;
        Box::pin(async move {
            crate::traits::DependencyStatus {
                is_ready: ready,
                discovered_path: if ready { Some("/opt/homebrew/bin/sshfs".to_string()) } else { None },
                issues: if ready { vec![] } else { vec!["sshfs not found".to_string()] },
            }
        })
    }
}
