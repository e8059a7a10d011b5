//! `Core`: the façade that wires the Operations Engine, Recovery
//! Controller, Mount Manager, Directory Browser Sessions, Password
//! Resolver, and Diagnostics into one public surface.

use std::sync::Arc;

use crate::browser::{BrowserSessionManager, DirectoryTransportFactory};
use crate::diagnostics::Diagnostics;
use crate::error::CoreError;
use crate::model::{
    BrowserConnectionHealth, BrowserSnapshot, ConflictPolicy, OperationIntent, OperationTrigger, RecoveryIndicator,
    RemoteConfig, RemoteId, RemoteStatus,
};
use crate::mount_manager::{ForceStopOptions, MountManager};
use crate::mount_table::MountTableInspector;
use crate::operations::OperationsEngine;
use crate::password::PasswordResolver;
use crate::process::ProcessExecutor;
use crate::recovery::RecoveryController;
use crate::traits::{DependencyChecker, DependencyStatus, RemoteStore, SecretStore};
use crate::unmount::UnmountService;

/// Immutable collaborators supplied by the embedding application. Storage,
/// Keychain access, and dependency discovery live outside this crate.
pub struct CoreDeps {
    pub executor: Arc<dyn ProcessExecutor>,
    pub remote_store: Arc<dyn RemoteStore>,
    pub secret_store: Arc<dyn SecretStore>,
    pub dependency_checker: Arc<dyn DependencyChecker>,
    pub transport_factory: Arc<dyn DirectoryTransportFactory>,
    pub global_max_concurrent: Option<usize>,
}

pub struct Core {
    mount_manager: Arc<MountManager>,
    operations: Arc<OperationsEngine>,
    recovery: Arc<RecoveryController>,
    browser: Arc<BrowserSessionManager>,
    password: Arc<PasswordResolver>,
    diagnostics: Arc<Diagnostics>,
    dependency_checker: Arc<dyn DependencyChecker>,
    remote_store: Arc<dyn RemoteStore>,
}

impl Core {
    pub fn new(deps: CoreDeps) -> Self {
        let inspector = Arc::new(MountTableInspector::new(deps.executor.clone()));
        let unmounter = Arc::new(UnmountService::new(deps.executor.clone(), inspector.clone()));
        let mount_manager = Arc::new(MountManager::new(deps.executor.clone(), inspector, unmounter));
        let operations = Arc::new(match deps.global_max_concurrent {
            Some(cap) => OperationsEngine::with_capacity(cap),
            None => OperationsEngine::new(),
        });
        let password = Arc::new(PasswordResolver::new(deps.secret_store.clone()));
        let diagnostics = Arc::new(Diagnostics::new());
        let recovery = Arc::new(RecoveryController::new(
            operations.clone(),
            mount_manager.clone(),
            password.clone(),
            deps.remote_store.clone(),
            diagnostics.clone(),
        ));
        let browser = Arc::new(BrowserSessionManager::new(deps.transport_factory.clone()));

        Self {
            mount_manager,
            operations,
            recovery,
            browser,
            password,
            diagnostics,
            dependency_checker: deps.dependency_checker,
            remote_store: deps.remote_store,
        }
    }

    /// Load persisted remotes and compute the desired-connections set, and
    /// discover the sshfs binary path so later connect attempts don't rely
    /// on a bare `sshfs` resolving against the embedding app's `PATH`. Call
    /// once at startup before any lifecycle event.
    pub async fn load(&self) -> Result<(), CoreError> {
        let dep_status = self.dependency_checker.check().await;
        if let Some(path) = dep_status.discovered_path {
            self.mount_manager.set_sshfs_path(path);
        }
        self.recovery.load().await
    }

    /// Start the periodic recovery timer. The returned handle should be kept
    /// alive (or aborted) by the caller for the life of the application.
    pub fn start_recovery_timer(&self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        self.recovery.spawn_periodic_timer(interval)
    }

    pub fn status(&self, remote_id: &str) -> RemoteStatus {
        self.recovery.status(remote_id)
    }

    pub fn all_statuses(&self) -> std::collections::HashMap<RemoteId, RemoteStatus> {
        self.recovery.all_statuses()
    }

    pub fn recovery_indicator(&self) -> Option<RecoveryIndicator> {
        self.recovery.indicator()
    }

    async fn find_remote(&self, remote_id: &str) -> Result<RemoteConfig, CoreError> {
        self.remote_store
            .load()
            .await?
            .into_iter()
            .find(|r| r.id == remote_id)
            .ok_or_else(|| CoreError::validation(format!("unknown remote {remote_id}")))
    }

    /// Manually connect a remote, admitted through the Operations Engine
    /// under `LatestIntentWins` so a second manual connect supersedes a
    /// stuck first attempt.
    pub async fn connect(&self, remote_id: &str, password_draft: Option<&str>) -> Result<RemoteStatus, CoreError> {
        let remote = self.find_remote(remote_id).await?;
        let password = self.password.resolve(remote_id, password_draft).await?;
        if let Some(pw) = password.as_deref() {
            self.diagnostics.register_secret(pw);
        }
        let mount_manager = self.mount_manager.clone();
        let id_for_cb = remote_id.to_string();
        let recovery = self.recovery.clone();
        let on_transition = move |status: RemoteStatus| {
            recovery.set_status_external(&id_for_cb, status);
        };

        let rx = self
            .operations
            .submit(remote_id.to_string(), OperationIntent::Connect, OperationTrigger::Manual, ConflictPolicy::LatestIntentWins, move |_cancel| async move {
                mount_manager.connect(&remote, password.as_deref(), &on_transition).await
            })?;

        let result = rx.await.map_err(|_| CoreError::Cancelled)?;
        match &result {
            Ok(status) => self.recovery.set_status_external(remote_id, status.clone()),
            Err(e) => self.recovery.set_status_external(remote_id, RemoteStatus::error(e.user_message())),
        }
        result
    }

    pub async fn disconnect(&self, remote_id: &str) -> Result<RemoteStatus, CoreError> {
        let remote = self.find_remote(remote_id).await?;
        let mount_manager = self.mount_manager.clone();
        let id_for_cb = remote_id.to_string();
        let recovery = self.recovery.clone();
        let on_transition = move |status: RemoteStatus| {
            recovery.set_status_external(&id_for_cb, status);
        };

        let rx = self
            .operations
            .submit(remote_id.to_string(), OperationIntent::Disconnect, OperationTrigger::Manual, ConflictPolicy::LatestIntentWins, move |_cancel| async move {
                mount_manager.disconnect(&remote, &on_transition).await
            })?;

        let result = rx.await.map_err(|_| CoreError::Cancelled)?;
        match &result {
            Ok(status) => self.recovery.set_status_external(remote_id, status.clone()),
            Err(e) => self.recovery.set_status_external(remote_id, RemoteStatus::error(e.user_message())),
        }
        result
    }

    pub async fn test_connection(&self, remote_id: &str, password_draft: Option<&str>) -> Result<String, CoreError> {
        let remote = self.find_remote(remote_id).await?;
        let password = self.password.resolve(remote_id, password_draft).await?;
        if let Some(pw) = password.as_deref() {
            self.diagnostics.register_secret(pw);
        }
        let mount_manager = self.mount_manager.clone();

        let rx = self
            .operations
            .submit(remote_id.to_string(), OperationIntent::Test, OperationTrigger::Manual, ConflictPolicy::SkipIfBusy, move |_cancel| async move {
                mount_manager.test(&remote, password.as_deref()).await.map(|_| RemoteStatus::disconnected())
            })?;

        match rx.await.map_err(|_| CoreError::Cancelled)? {
            Ok(_) => Ok(format!("Connection to {remote_id} succeeded")),
            Err(e) => Err(e),
        }
    }

    pub async fn force_stop(&self, remote_id: &str) -> Result<RemoteStatus, CoreError> {
        let remote = self.find_remote(remote_id).await?;
        let status = self.mount_manager.force_stop_helpers(&remote, ForceStopOptions::default()).await?;
        self.recovery.set_status_external(remote_id, status.clone());
        Ok(status)
    }

    // --- Directory browser -------------------------------------------------

    pub async fn open_browser(&self, remote_id: &str, password_draft: Option<&str>) -> Result<String, CoreError> {
        let remote = self.find_remote(remote_id).await?;
        let password = self.password.resolve(remote_id, password_draft).await?;
        if let Some(pw) = password.as_deref() {
            self.diagnostics.register_secret(pw);
        }
        self.browser.open(&remote, password.as_deref()).await
    }

    pub async fn close_browser(&self, session_id: &str) {
        self.browser.close(session_id).await
    }

    pub async fn list_directory(&self, session_id: &str, path: &str, request_id: u64) -> Result<BrowserSnapshot, CoreError> {
        self.browser.list(session_id, path, request_id).await
    }

    pub async fn browser_go_up(&self, session_id: &str, current: &str, request_id: u64) -> Result<BrowserSnapshot, CoreError> {
        self.browser.go_up(session_id, current, request_id).await
    }

    pub async fn browser_retry(&self, session_id: &str, last_known: &str, request_id: u64) -> Result<BrowserSnapshot, CoreError> {
        self.browser.retry_current(session_id, last_known, request_id).await
    }

    pub async fn browser_health(&self, session_id: &str) -> Result<BrowserConnectionHealth, CoreError> {
        self.browser.health(session_id).await
    }

    // --- Lifecycle -----------------------------------------------------------

    pub fn on_will_sleep(&self) {
        self.recovery.on_will_sleep();
    }

    pub async fn on_did_wake(&self) {
        self.recovery.on_did_wake().await;
    }

    pub async fn on_network_became_reachable(&self) {
        self.recovery.on_network_became_reachable().await;
    }

    pub fn on_network_became_unreachable(&self) {
        self.recovery.on_network_became_unreachable();
    }

    pub fn on_external_unmount(&self, remote_id: &str) {
        self.recovery.on_external_unmount(remote_id);
    }

    pub async fn run_startup_auto_connect(&self) {
        self.recovery.run_startup_auto_connect().await;
    }

    /// Cancel every in-flight operation and scheduled reconnect, then
    /// best-effort force-stop helpers for every desired remote with
    /// `skip_force_unmount = true`, per the shutdown cancellation contract.
    pub async fn shutdown(&self) {
        self.operations.cancel_all();
        self.recovery.on_will_sleep();
        if let Ok(remotes) = self.remote_store.load().await {
            for remote in remotes {
                let _ = self.mount_manager.force_stop_helpers(&remote, ForceStopOptions { aggressive: true, skip_force_unmount: true }).await;
            }
        }
    }

    pub async fn dependency_status(&self) -> DependencyStatus {
        self.dependency_checker.check().await
    }

    /// Build a redacted multi-section diagnostics report covering remotes,
    /// statuses, dependency status, and browser-session summary.
    pub async fn diagnostics_snapshot(&self, extra_secrets: &[String]) -> String {
        let remotes = self.remote_store.load().await.unwrap_or_default();
        let statuses = self.all_statuses();
        let dep = self.dependency_status().await;
        let browser_summary = self.browser.summary().await;

        let remotes_section = remotes.iter().map(|r| format!("{} ({})", r.id, r.display_name)).collect::<Vec<_>>().join("\n");
        let statuses_section = statuses.iter().map(|(id, s)| format!("{id}: {:?}", s.state)).collect::<Vec<_>>().join("\n");
        let dep_section = format!("ready={} path={:?} issues={:?}", dep.is_ready, dep.discovered_path, dep.issues);
        let browser_section = browser_summary.iter().map(|(id, h)| format!("{id}: {:?}", h.state)).collect::<Vec<_>>().join("\n");

        let sections = vec![
            ("Remotes", remotes_section),
            ("Statuses", statuses_section),
            ("Dependency", dep_section),
            ("Browser Sessions", browser_section),
        ];
        self.diagnostics.snapshot(&sections, extra_secrets)
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        self.diagnostics.clone()
    }
}
