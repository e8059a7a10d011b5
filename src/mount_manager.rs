//! 4.E Mount Manager: per-remote connect / disconnect / refresh / test /
//! force-stop. Every public method is free of shared mutable state across
//! remotes — the Operations Engine (4.G) guarantees at most one call is
//! in flight per remote at a time, and per-remote runtime counters
//! (preserve-miss) are threaded through as parameters/return values rather
//! than owned here, since the spec assigns their ownership to the
//! Recovery+Operations coordinator.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::askpass;
use crate::config::{
    BUSY_PRECHECK_WAIT, CONNECTING_MIN_VISIBLE, DISCONNECTING_MIN_VISIBLE, FORCE_STOP_SIGNAL_GAP,
    MAX_PRESERVE_MISSES, MOUNT_POLL_TIMEOUT, RESPONSIVENESS_PROBE_TIMEOUT, SSHFS_CONNECT_TIMEOUT,
};
use crate::error::CoreError;
use crate::model::{AuthMode, ConnectionState, RemoteConfig, RemoteStatus};
use crate::mount_table::MountTableInspector;
use crate::path;
use crate::process::ProcessExecutor;
use crate::unmount::{matching_sshfs_pids, UnmountService};

const SSHFS_PATH: &str = "sshfs";
const PS_PATH: &str = "/bin/ps";
const KILL_PATH: &str = "/bin/kill";
const STAT_PATH: &str = "/usr/bin/stat";

/// Options for [`MountManager::force_stop_helpers`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceStopOptions {
    /// Skip the terminate grace period and send SIGKILL immediately; used by
    /// the wake preflight's parallel fast force-unmount.
    pub aggressive: bool,
    /// Never touch mount paths (no `diskutil unmount`); used during host
    /// shutdown and pre-connect cleanup to avoid OS-level volume prompts.
    pub skip_force_unmount: bool,
}

/// Result of a refresh pass, carrying the updated preserve-miss counter back
/// to the coordinator that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub status: RemoteStatus,
    pub preserve_miss: u32,
}

pub struct MountManager {
    executor: Arc<dyn ProcessExecutor>,
    inspector: Arc<MountTableInspector>,
    unmounter: Arc<UnmountService>,
    sshfs_path: Mutex<String>,
}

impl MountManager {
    pub fn new(executor: Arc<dyn ProcessExecutor>, inspector: Arc<MountTableInspector>, unmounter: Arc<UnmountService>) -> Self {
        Self { executor, inspector, unmounter, sshfs_path: Mutex::new(SSHFS_PATH.to_string()) }
    }

    /// Override the resolved `sshfs` executable path at construction time.
    pub fn with_sshfs_path(self, path: impl Into<String>) -> Self {
        self.set_sshfs_path(path);
        self
    }

    /// Override the resolved `sshfs` executable path after construction.
    /// `Core::load` calls this once at startup with the path the dependency
    /// checker discovered, since `Core::new` can't await that async check.
    pub fn set_sshfs_path(&self, path: impl Into<String>) {
        *self.sshfs_path.lock().unwrap() = path.into();
    }

    fn sshfs_path(&self) -> String {
        self.sshfs_path.lock().unwrap().clone()
    }

    pub async fn refresh_status(&self, remote: &RemoteConfig, previous: &RemoteStatus, preserve_miss: u32) -> Result<RefreshOutcome, CoreError> {
        let normalized = path::normalize(&remote.local_mount_path);
        let record = self.inspector.find(&normalized).await?;

        if let Some(record) = record {
            // A kernel mount table entry alone doesn't mean the FUSE daemon
            // behind it is still alive, so a present record still has to
            // pass the responsiveness probe before it counts as connected.
            if self.probe_responsive(&normalized).await {
                return Ok(RefreshOutcome { status: RemoteStatus::connected(record.mount_point), preserve_miss: 0 });
            }
            return Ok(RefreshOutcome { status: RemoteStatus::error(format!("stale mount: {normalized} is unresponsive")), preserve_miss: 0 });
        }

        if previous.state != ConnectionState::Connected {
            return Ok(RefreshOutcome { status: RemoteStatus::disconnected(), preserve_miss: 0 });
        }

        // Primary lookup missed while we believed we were connected: try a
        // df fallback plus a short responsiveness probe before giving up.
        let responsive = self.probe_responsive(&normalized).await;
        if responsive && preserve_miss < MAX_PRESERVE_MISSES {
            return Ok(RefreshOutcome { status: RemoteStatus::connected(normalized), preserve_miss: preserve_miss + 1 });
        }
        if responsive {
            return Ok(RefreshOutcome {
                status: RemoteStatus::error("Mount verification failed after repeated misses"),
                preserve_miss: 0,
            });
        }
        Ok(RefreshOutcome { status: RemoteStatus::error("stale mount: path is unresponsive"), preserve_miss: 0 })
    }

    async fn probe_responsive(&self, normalized_path: &str) -> bool {
        match self.executor.run(STAT_PATH, &["-f".into(), "%N".into(), normalized_path.into()], &[], RESPONSIVENESS_PROBE_TIMEOUT, None, None).await {
            Ok(out) => out.success() && !out.timed_out,
            Err(_) => false,
        }
    }

    pub async fn connect(
        &self,
        remote: &RemoteConfig,
        password: Option<&str>,
        on_transition: &(dyn Fn(RemoteStatus) + Send + Sync),
    ) -> Result<RemoteStatus, CoreError> {
        let started = Instant::now();
        on_transition(RemoteStatus::connecting());

        let normalized = path::normalize(&remote.local_mount_path);

        if self.inspector.find(&normalized).await?.is_some() {
            self.force_stop_helpers(remote, ForceStopOptions { aggressive: false, skip_force_unmount: true }).await?;
            tokio::time::sleep(BUSY_PRECHECK_WAIT).await;
            if self.inspector.find(&normalized).await?.is_some() {
                return Err(CoreError::Busy(vec![]));
            }
        }

        tokio::fs::create_dir_all(&normalized)
            .await
            .map_err(|e| CoreError::validation(format!("cannot create mount path {normalized}: {e}")))?;

        let result = self.attempt_sshfs(remote, password, &normalized).await;

        let result = match result {
            Err(CoreError::Transient(_)) => {
                let _ = self.unmounter.unmount(&normalized, &remote.source_spec()).await;
                tokio::fs::create_dir_all(&normalized).await.ok();
                self.attempt_sshfs(remote, password, &normalized).await
            }
            other => other,
        };

        self.enforce_min_visible(started, CONNECTING_MIN_VISIBLE).await;

        match result {
            Ok(status) => Ok(status),
            Err(e) => {
                let _ = self.unmounter.unmount(&normalized, &remote.source_spec()).await;
                Err(e)
            }
        }
    }

    async fn attempt_sshfs(&self, remote: &RemoteConfig, password: Option<&str>, normalized_path: &str) -> Result<RemoteStatus, CoreError> {
        let args = build_sshfs_args(remote);

        let run_result = match (remote.auth_mode, password) {
            (AuthMode::Password, Some(pw)) => {
                askpass::with_context(pw, |ctx| {
                    let executor = self.executor.clone();
                    let sshfs_path = self.sshfs_path();
                    let args = args.clone();
                    let env = ctx.env.clone();
                    async move { executor.run(&sshfs_path, &args, &env, SSHFS_CONNECT_TIMEOUT, None, None).await }
                })
                .await?
            }
            (AuthMode::Password, None) => {
                return Err(CoreError::PermanentFailure(format!(
                    "password missing for {}: no credential resolved",
                    remote.display_name
                )));
            }
            (AuthMode::PrivateKey, _) => self.executor.run(&self.sshfs_path(), &args, &[], SSHFS_CONNECT_TIMEOUT, None, None).await?,
        };

        if run_result.timed_out {
            return Err(CoreError::timeout(format!("sshfs connect to {} timed out", remote.display_name)));
        }
        if !run_result.success() {
            return Err(CoreError::classify_process_message(run_result.exit_code, &run_result.combined()));
        }

        let deadline = Instant::now() + MOUNT_POLL_TIMEOUT;
        loop {
            if let Some(record) = self.inspector.find(normalized_path).await? {
                return Ok(RemoteStatus::connected(record.mount_point));
            }
            if Instant::now() >= deadline {
                return Err(CoreError::timeout(format!("mount of {normalized_path} never appeared in mount table")));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn disconnect(&self, remote: &RemoteConfig, on_transition: &(dyn Fn(RemoteStatus) + Send + Sync)) -> Result<RemoteStatus, CoreError> {
        let started = Instant::now();
        on_transition(RemoteStatus::disconnecting());

        let normalized = path::normalize(&remote.local_mount_path);
        if self.inspector.find(&normalized).await?.is_some() {
            self.unmounter.unmount(&normalized, &remote.source_spec()).await?;
        }

        self.enforce_min_visible(started, DISCONNECTING_MIN_VISIBLE).await;

        if self.inspector.find(&normalized).await?.is_some() {
            return Err(CoreError::process_failure(None, format!("{normalized} still mounted after disconnect")));
        }
        Ok(RemoteStatus::disconnected())
    }

    /// Identical mount flow to `connect`, but rejects if already mounted and
    /// tears the mount back down immediately on success.
    pub async fn test(&self, remote: &RemoteConfig, password: Option<&str>) -> Result<String, CoreError> {
        let normalized = path::normalize(&remote.local_mount_path);
        if self.inspector.find(&normalized).await?.is_some() {
            return Err(CoreError::Busy(vec![]));
        }

        tokio::fs::create_dir_all(&normalized)
            .await
            .map_err(|e| CoreError::validation(format!("cannot create mount path {normalized}: {e}")))?;

        match self.attempt_sshfs(remote, password, &normalized).await {
            Ok(_) => {
                let unmount_result = self.unmounter.unmount(&normalized, &remote.source_spec()).await;
                match unmount_result {
                    Ok(()) => Ok(format!("Connection to {} succeeded", remote.display_name)),
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                let _ = self.unmounter.unmount(&normalized, &remote.source_spec()).await;
                Err(e)
            }
        }
    }

    pub async fn force_stop_helpers(&self, remote: &RemoteConfig, opts: ForceStopOptions) -> Result<RemoteStatus, CoreError> {
        let normalized = path::normalize(&remote.local_mount_path);
        let needle = remote.source_spec();

        let out = self
            .executor
            .run(PS_PATH, &["-axo".into(), "pid=,command=".into()], &[], Duration::from_secs(3), None, None)
            .await?;
        let pids = matching_sshfs_pids(&out.stdout, &normalized, &needle);

        for pid in &pids {
            let _ = self.executor.run(KILL_PATH, &["-TERM".into(), pid.to_string()], &[], Duration::from_secs(2), None, None).await;
        }
        if !opts.aggressive {
            tokio::time::sleep(FORCE_STOP_SIGNAL_GAP).await;
        }
        for pid in &pids {
            let _ = self.executor.run(KILL_PATH, &["-KILL".into(), pid.to_string()], &[], Duration::from_secs(2), None, None).await;
        }

        if !opts.skip_force_unmount {
            let _ = self.unmounter.unmount(&normalized, &needle).await;
        }

        if self.inspector.find(&normalized).await?.is_none() {
            Ok(RemoteStatus::disconnected())
        } else {
            Ok(RemoteStatus::error("stale mount could not be cleared"))
        }
    }

    async fn enforce_min_visible(&self, started: Instant, minimum: Duration) {
        let elapsed = started.elapsed();
        if elapsed < minimum {
            tokio::time::sleep(minimum - elapsed).await;
        }
    }
}

/// Build the `sshfs` argument vector per the fixed External Interfaces
/// contract: secrets never appear here, only the resolved program path and
/// argument vector (the password travels through the askpass environment).
pub fn build_sshfs_args(remote: &RemoteConfig) -> Vec<String> {
    let mut args = vec![
        remote.source_spec(),
        remote.local_mount_path.clone(),
        "-p".into(),
        remote.port.to_string(),
        "-o".into(),
        format!("port={}", remote.port),
        "-o".into(),
        "reconnect,ServerAliveInterval=15,ServerAliveCountMax=3".into(),
        "-o".into(),
        "defer_permissions".into(),
        "-o".into(),
        "noappledouble".into(),
        "-o".into(),
        format!("volname={}", remote.display_name),
    ];
    match remote.auth_mode {
        AuthMode::Password => {
            args.push("-o".into());
            args.push("NumberOfPasswordPrompts=1".into());
        }
        AuthMode::PrivateKey => {
            if let Some(key) = &remote.private_key_path {
                args.push("-o".into());
                args.push(format!("IdentityFile={key}"));
            }
            args.push("-o".into());
            args.push("BatchMode=yes".into());
        }
    }
    args
}

/// Transition table for the per-remote status field, for callers that need
/// to validate a transition before publishing it.
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Error)
            | (Connected, Connected)
            | (Connected, Error)
            | (Connected, Disconnecting)
            | (Disconnecting, Disconnected)
            | (Disconnecting, Error)
            | (Error, Connecting)
            | (Error, Disconnected)
    )
}
