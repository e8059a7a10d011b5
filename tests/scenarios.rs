//! End-to-end scenarios exercised against the [`mountkeepd::core::Core`]
//! façade with fake collaborators, one per literal scenario in the
//! connection-management design.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use mountkeepd::browser::{BoxFuture, DirectoryTransport, DirectoryTransportFactory};
use mountkeepd::core::{Core, CoreDeps};
use mountkeepd::error::CoreError;
use mountkeepd::model::{AuthMode, ConnectionState, DirEntry, RemoteConfig};
use mountkeepd::process::{ProcessExecutor, ProcessOutput};
use mountkeepd::traits::{DependencyChecker, DependencyStatus, RemoteStore, SecretStore};

fn ok_output(stdout: impl Into<String>) -> ProcessOutput {
    ProcessOutput { exit_code: Some(0), stdout: stdout.into(), stderr: String::new(), timed_out: false, duration: Duration::from_millis(1) }
}

fn fail_output(stderr: impl Into<String>) -> ProcessOutput {
    ProcessOutput { exit_code: Some(1), stdout: String::new(), stderr: stderr.into(), timed_out: false, duration: Duration::from_millis(1) }
}

/// Executor that also plays the part of the kernel mount table: a
/// successful `sshfs` call records its mount point, a successful unmount
/// ladder step clears it, and `/sbin/mount` lists whatever is currently
/// recorded. Explicit per-executable queues take priority over that
/// bookkeeping, so tests can force a specific failure at a specific step.
struct FakeExecutor {
    queues: Mutex<HashMap<String, VecDeque<Result<ProcessOutput, CoreError>>>>,
    mounted: Mutex<HashMap<String, String>>,
    ps_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FakeExecutor {
    fn new() -> Self {
        Self { queues: Mutex::new(HashMap::new()), mounted: Mutex::new(HashMap::new()), ps_gate: Mutex::new(None) }
    }

    fn with_mount(path: &str, source: &str) -> Self {
        let exec = Self::new();
        exec.mounted.lock().unwrap().insert(path.to_string(), source.to_string());
        exec
    }

    fn push(&self, executable: &str, result: Result<ProcessOutput, CoreError>) {
        self.queues.lock().unwrap().entry(executable.to_string()).or_default().push_back(result);
    }

    fn push_ok(&self, executable: &str, stdout: impl Into<String>) {
        self.push(executable, Ok(ok_output(stdout)));
    }

    fn push_fail(&self, executable: &str, stderr: impl Into<String>) {
        self.push(executable, Ok(fail_output(stderr)));
    }

    /// Block the first `/bin/ps` call (the one `force_stop_helpers` issues
    /// during wake preflight) until the test releases it, notifying the
    /// test once the call has actually started.
    fn arm_ps_gate(&self) -> (Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let resume = Arc::new(Notify::new());
        *self.ps_gate.lock().unwrap() = Some((started.clone(), resume.clone()));
        (started, resume)
    }

    fn default_response(&self, executable: &str, args: &[String]) -> ProcessOutput {
        match executable {
            "sshfs" => {
                if let (Some(source), Some(path)) = (args.first(), args.get(1)) {
                    self.mounted.lock().unwrap().insert(path.clone(), source.clone());
                }
                ok_output("")
            }
            "/sbin/mount" => {
                let listing: String = self
                    .mounted
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(path, source)| format!("{source} on {path} (macfuse, nodev)\n"))
                    .collect();
                ok_output(listing)
            }
            "/usr/sbin/diskutil" | "/sbin/umount" => {
                if let Some(path) = args.last() {
                    self.mounted.lock().unwrap().remove(path);
                }
                ok_output("")
            }
            _ => ok_output(""),
        }
    }
}

impl ProcessExecutor for FakeExecutor {
    fn run<'a>(
        &'a self,
        executable: &'a str,
        args: &'a [String],
        _env: &'a [(String, String)],
        _timeout: Duration,
        _stdin: Option<&'a [u8]>,
        _cancel: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> BoxFuture<'a, Result<ProcessOutput, CoreError>> {
        let queued = self.queues.lock().unwrap().get_mut(executable).and_then(|q| q.pop_front());
        let gate = if executable == "/bin/ps" { self.ps_gate.lock().unwrap().take() } else { None };
        Box::pin(async move {
            if let Some((started, resume)) = gate {
                started.notify_one();
                resume.notified().await;
            }
            match queued {
                Some(result) => result,
                None => Ok(self.default_response(executable, args)),
            }
        })
    }
}

struct FakeStore {
    remotes: Mutex<Vec<RemoteConfig>>,
}

impl RemoteStore for FakeStore {
    fn load<'a>(&'a self) -> BoxFuture<'a, Result<Vec<RemoteConfig>, CoreError>> {
        let remotes = self.remotes.lock().unwrap().clone();
        Box::pin(async move { Ok(remotes) })
    }

    fn upsert<'a>(&'a self, remote: RemoteConfig) -> BoxFuture<'a, Result<(), CoreError>> {
        let mut remotes = self.remotes.lock().unwrap();
        remotes.retain(|r| r.id != remote.id);
        remotes.push(remote);
        Box::pin(async { Ok(()) })
    }

    fn delete<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        self.remotes.lock().unwrap().retain(|r| r.id != remote_id);
        Box::pin(async { Ok(()) })
    }
}

struct FakeSecrets {
    values: Mutex<HashMap<String, String>>,
    reads: Mutex<Vec<String>>,
}

impl FakeSecrets {
    fn new(initial: Vec<(&str, &str)>) -> Self {
        Self {
            values: Mutex::new(initial.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            reads: Mutex::new(vec![]),
        }
    }
}

impl SecretStore for FakeSecrets {
    fn save<'a>(&'a self, remote_id: &'a str, secret: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        self.values.lock().unwrap().insert(remote_id.to_string(), secret.to_string());
        Box::pin(async { Ok(()) })
    }

    fn read<'a>(&'a self, remote_id: &'a str, _allow_user_interaction: bool) -> BoxFuture<'a, Result<Option<String>, CoreError>> {
        self.reads.lock().unwrap().push(remote_id.to_string());
        let value = self.values.lock().unwrap().get(remote_id).cloned();
        Box::pin(async move { Ok(value) })
    }

    fn delete<'a>(&'a self, remote_id: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        self.values.lock().unwrap().remove(remote_id);
        Box::pin(async { Ok(()) })
    }
}

struct AlwaysReady;

impl DependencyChecker for AlwaysReady {
    fn check<'a>(&'a self) -> BoxFuture<'a, DependencyStatus> {
        // The fake executor's mount bookkeeping keys off the literal
        // executable name "sshfs", so the discovered path has to match it
        // exactly for Core::load's dependency-check wiring to not break the
        // fake mount table simulation.
        Box::pin(async { DependencyStatus { is_ready: true, discovered_path: Some("sshfs".to_string()), issues: vec![] } })
    }
}

struct FailingTransport;

impl DirectoryTransport for FailingTransport {
    fn list_directory<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<Vec<DirEntry>, CoreError>> {
        Box::pin(async { Err(CoreError::validation("no browser transport configured in this test")) })
    }
}

struct NoTransport;

impl DirectoryTransportFactory for NoTransport {
    fn open<'a>(&'a self, _remote: &'a RemoteConfig, _password: Option<&'a str>) -> BoxFuture<'a, Result<Arc<dyn DirectoryTransport>, CoreError>> {
        Box::pin(async { Ok(Arc::new(FailingTransport) as Arc<dyn DirectoryTransport>) })
    }
}

fn remote(id: &str, mount_path: &str, auth_mode: AuthMode) -> RemoteConfig {
    RemoteConfig {
        id: id.to_string(),
        display_name: id.to_string(),
        host: "example.com".into(),
        port: 22,
        username: "alice".into(),
        remote_dir: "/srv/data".into(),
        local_mount_path: mount_path.to_string(),
        auth_mode,
        private_key_path: None,
        auto_connect_on_launch: true,
        favorite_paths: vec![],
        recent_paths: vec![],
    }
}

fn make_core(executor: Arc<FakeExecutor>, remotes: Vec<RemoteConfig>, secrets: Arc<FakeSecrets>) -> Core {
    Core::new(CoreDeps {
        executor,
        remote_store: Arc::new(FakeStore { remotes: Mutex::new(remotes) }),
        secret_store: secrets,
        dependency_checker: Arc::new(AlwaysReady),
        transport_factory: Arc::new(NoTransport),
        global_max_concurrent: None,
    })
}

/// Scenario 1: wake recovery. `did-wake` forces the desired remote to
/// `disconnected` (tearing its helper down even though the fixture's
/// `sshfs` session was never actually killed out from under it), and the
/// subsequent recovery burst reconnects it.
#[tokio::test(start_paused = true)]
async fn wake_recovery_reconnects_a_dropped_remote() {
    let executor = Arc::new(FakeExecutor::new());
    let core = make_core(executor, vec![remote("a", "/tmp/mountkeepd-scn/a", AuthMode::Password)], Arc::new(FakeSecrets::new(vec![("a", "hunter2")])));
    core.load().await.unwrap();
    core.run_startup_auto_connect().await;
    assert_eq!(core.status("a").state, ConnectionState::Connected);

    core.on_will_sleep();
    core.on_did_wake().await;
    tokio::time::sleep(Duration::from_secs(9)).await;

    assert_eq!(core.status("a").state, ConnectionState::Connected);
}

/// Scenario 2: busy unmount. When `lsof` reports a non-sshfs blocker, the
/// unmount service gives up rather than killing an unrelated process, and
/// reports which process is in the way. The mount is never cleared.
#[tokio::test]
async fn busy_unmount_reports_the_blocking_process() {
    use mountkeepd::mount_table::MountTableInspector;
    use mountkeepd::unmount::UnmountService;

    let executor = Arc::new(FakeExecutor::with_mount("/mnt/x", "alice@example.com:/srv/data"));
    executor.push_fail("/usr/sbin/diskutil", "resource busy");
    executor.push_ok("/usr/sbin/lsof", "p412\ncFinder\nn/mnt/x\n");

    let inspector = Arc::new(MountTableInspector::new(executor.clone()));
    let unmounter = UnmountService::new(executor.clone(), inspector);

    let result = unmounter.unmount("/mnt/x", "alice@example.com:/srv/data").await;
    match result {
        Err(CoreError::Busy(blockers)) => {
            assert_eq!(blockers, vec![mountkeepd::error::Blocker { command: "Finder".into(), pid: 412 }]);
        }
        other => panic!("expected Busy(..), got {other:?}"),
    }
    assert!(executor.mounted.lock().unwrap().contains_key("/mnt/x"), "mount must remain present after a busy unmount");
}

/// Scenario 3: stalled connect replacement. A manual connect admitted
/// under `latest-intent-wins` semantics is cancelled the instant a second
/// manual connect for the same remote is submitted.
#[tokio::test]
async fn a_second_manual_connect_cancels_the_first() {
    use mountkeepd::model::{ConflictPolicy, OperationIntent, OperationTrigger};
    use mountkeepd::operations::OperationsEngine;

    let engine = OperationsEngine::new();
    let first = engine
        .submit("a".to_string(), OperationIntent::Connect, OperationTrigger::Manual, ConflictPolicy::LatestIntentWins, |flag| async move {
            loop {
                if flag.load(std::sync::atomic::Ordering::SeqCst) {
                    return Err(CoreError::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .unwrap();

    let second = engine
        .submit("a".to_string(), OperationIntent::Connect, OperationTrigger::Manual, ConflictPolicy::LatestIntentWins, |_flag| async move {
            Ok(mountkeepd::model::RemoteStatus::connected("/mnt/a"))
        })
        .unwrap();

    assert!(matches!(first.await.unwrap(), Err(CoreError::Cancelled)));
    assert!(second.await.unwrap().is_ok());
}

/// Scenario 4: periodic healthy skip. Once a desired remote is connected
/// and a first periodic probe has run, subsequent ticks inside the
/// healthy-probe window must not disturb its status.
#[tokio::test(start_paused = true)]
async fn periodic_tick_skips_once_a_recent_probe_confirmed_health() {
    let executor = Arc::new(FakeExecutor::new());
    let core = Arc::new(make_core(executor, vec![remote("a", "/tmp/mountkeepd-scn/a", AuthMode::Password)], Arc::new(FakeSecrets::new(vec![("a", "hunter2")]))));
    core.load().await.unwrap();
    core.run_startup_auto_connect().await;
    assert_eq!(core.status("a").state, ConnectionState::Connected);

    let _timer = core.start_recovery_timer(Duration::from_secs(15));
    // First tick (t=15s) always runs a probe since none has run yet; later
    // ticks (t=30s, t=45s) land inside the 60s healthy-probe window and
    // must be no-ops.
    tokio::time::sleep(Duration::from_secs(40)).await;

    assert_eq!(core.status("a").state, ConnectionState::Connected);
    assert!(core.recovery_indicator().is_none());
}

/// Scenario 5: password-mode startup. Two password-mode remotes each get
/// their credential read exactly once before any connect is attempted
/// concurrently, and the password never leaks into the diagnostics export.
#[tokio::test(start_paused = true)]
async fn password_mode_startup_primes_cache_then_connects_concurrently() {
    let executor = Arc::new(FakeExecutor::new());
    let secrets = Arc::new(FakeSecrets::new(vec![("a", "hunter2"), ("b", "hunter3")]));

    let remotes = vec![remote("a", "/tmp/mountkeepd-scn/a", AuthMode::Password), remote("b", "/tmp/mountkeepd-scn/b", AuthMode::Password)];
    let core = make_core(executor, remotes, secrets.clone());
    core.load().await.unwrap();
    core.run_startup_auto_connect().await;

    assert_eq!(core.status("a").state, ConnectionState::Connected);
    assert_eq!(core.status("b").state, ConnectionState::Connected);

    let report = core.diagnostics_snapshot(&[]).await;
    assert!(!report.contains("hunter2"));
    assert!(!report.contains("hunter3"));

    let reads = secrets.reads.lock().unwrap();
    assert_eq!(reads.iter().filter(|id| id.as_str() == "a").count(), 1, "the connect task must reuse the primed cache entry");
    assert_eq!(reads.iter().filter(|id| id.as_str() == "b").count(), 1);
}

/// Scenario 6: external volume unmount during preflight. An unmount signal
/// that arrives while wake preflight is still running is dropped instead
/// of scheduling a reconnect; the remote still ends up reconnected once
/// the wake burst runs.
#[tokio::test(start_paused = true)]
async fn external_unmount_is_ignored_during_wake_preflight() {
    let executor = Arc::new(FakeExecutor::new());
    let core = Arc::new(make_core(executor.clone(), vec![remote("a", "/tmp/mountkeepd-scn/a", AuthMode::Password)], Arc::new(FakeSecrets::new(vec![("a", "hunter2")]))));
    core.load().await.unwrap();
    core.run_startup_auto_connect().await;
    assert_eq!(core.status("a").state, ConnectionState::Connected);

    let (started, resume) = executor.arm_ps_gate();
    core.on_will_sleep();
    let core_bg = core.clone();
    let did_wake = tokio::spawn(async move { core_bg.on_did_wake().await });

    // Wait until force_stop_helpers is blocked mid-preflight on its `ps`
    // call, which is exactly the window the scenario targets.
    started.notified().await;
    core.on_external_unmount("a");
    resume.notify_one();

    did_wake.await.unwrap();
    tokio::time::sleep(Duration::from_secs(9)).await;

    assert_eq!(core.status("a").state, ConnectionState::Connected);
}
