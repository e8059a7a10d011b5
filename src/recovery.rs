//! 4.H Recovery Controller: tracks which remotes should be connected, runs
//! periodic and lifecycle-triggered recovery passes, and schedules
//! backed-off reconnect attempts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::config::{
    required_strikes, BACKOFF_CAP, HEALTHY_PROBE_INTERVAL, NETWORK_BURST_OFFSETS, NETWORK_DEBOUNCE,
    VOLUME_NONTRANSIENT_BACKOFF, VOLUME_TRANSIENT_BACKOFF, WAKE_BURST_OFFSETS, WAKE_NONTRANSIENT_BACKOFF,
    WAKE_TRANSIENT_BACKOFF,
};
use crate::diagnostics::Diagnostics;
use crate::error::CoreError;
use crate::model::{
    ConflictPolicy, ConnectionState, DiagnosticLevel, OperationIntent, OperationTrigger, RecoveryIndicator,
    RecoveryPassTrigger, RemoteConfig, RemoteId, RemoteStatus,
};
use crate::mount_manager::{ForceStopOptions, MountManager};
use crate::operations::OperationsEngine;
use crate::password::PasswordResolver;
use crate::traits::RemoteStore;

/// Substrings that mark a failure as permanent, per the recovery pass
/// contract: strikes never convert into a scheduled auto-reconnect once one
/// of these has been observed for the remote.
const PERMANENT_MARKERS: &[&str] = &[
    "authentication failed",
    "password missing",
    "password unavailable",
    "private-key error",
    "dependencies not ready",
    "mount-point shared",
    "permission denied",
];

fn looks_permanent(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    PERMANENT_MARKERS.iter().any(|m| lower.contains(m))
}

enum BackoffCategory {
    Wake,
    Volume,
}

fn backoff_category(trigger: RecoveryPassTrigger) -> BackoffCategory {
    match trigger {
        RecoveryPassTrigger::Wake | RecoveryPassTrigger::NetworkRestored | RecoveryPassTrigger::Periodic => BackoffCategory::Wake,
        RecoveryPassTrigger::Other => BackoffCategory::Volume,
    }
}

fn backoff_delay(trigger: RecoveryPassTrigger, attempt: u32, is_transient: bool) -> Duration {
    let table: &[u64] = match (backoff_category(trigger), is_transient) {
        (BackoffCategory::Wake, true) => WAKE_TRANSIENT_BACKOFF,
        (BackoffCategory::Wake, false) => WAKE_NONTRANSIENT_BACKOFF,
        (BackoffCategory::Volume, true) => VOLUME_TRANSIENT_BACKOFF,
        (BackoffCategory::Volume, false) => VOLUME_NONTRANSIENT_BACKOFF,
    };
    let idx = (attempt as usize).min(table.len() - 1);
    Duration::from_secs(table[idx]).min(BACKOFF_CAP)
}

struct RemoteCounters {
    reconnect_attempts: u32,
    non_connected_strikes: u32,
    preserve_miss: u32,
    last_recovery_refresh_at: Option<Instant>,
}

impl Default for RemoteCounters {
    fn default() -> Self {
        Self { reconnect_attempts: 0, non_connected_strikes: 0, preserve_miss: 0, last_recovery_refresh_at: None }
    }
}

/// Owns the runtime state the spec assigns to "the Recovery+Operations
/// coordinator": the status map, per-remote preserve-miss/strike/attempt
/// counters, the desired-connections set, and scheduled reconnect tasks.
pub struct RecoveryController {
    operations: Arc<OperationsEngine>,
    mount_manager: Arc<MountManager>,
    password: Arc<PasswordResolver>,
    remote_store: Arc<dyn RemoteStore>,
    diagnostics: Arc<Diagnostics>,

    desired: Mutex<HashSet<RemoteId>>,
    status: Mutex<HashMap<RemoteId, RemoteStatus>>,
    counters: Mutex<HashMap<RemoteId, RemoteCounters>>,
    pending_startup_auto_connect_ids: Mutex<HashSet<RemoteId>>,
    reconnect_tasks: Mutex<HashMap<RemoteId, JoinHandle<()>>>,

    sleeping: AtomicBool,
    preflight_active: AtomicBool,
    burst_active: AtomicBool,
    network_reachable: AtomicBool,
    last_periodic_probe_at: Mutex<Option<Instant>>,
}

impl RecoveryController {
    pub fn new(operations: Arc<OperationsEngine>, mount_manager: Arc<MountManager>, password: Arc<PasswordResolver>, remote_store: Arc<dyn RemoteStore>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            operations,
            mount_manager,
            password,
            remote_store,
            diagnostics,
            desired: Mutex::new(HashSet::new()),
            status: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            pending_startup_auto_connect_ids: Mutex::new(HashSet::new()),
            reconnect_tasks: Mutex::new(HashMap::new()),
            sleeping: AtomicBool::new(false),
            preflight_active: AtomicBool::new(false),
            burst_active: AtomicBool::new(false),
            network_reachable: AtomicBool::new(true),
            last_periodic_probe_at: Mutex::new(None),
        }
    }

    pub fn status(&self, remote_id: &str) -> RemoteStatus {
        self.status.lock().unwrap().get(remote_id).cloned().unwrap_or_else(RemoteStatus::disconnected)
    }

    pub fn all_statuses(&self) -> HashMap<RemoteId, RemoteStatus> {
        self.status.lock().unwrap().clone()
    }

    fn set_status(&self, remote_id: &str, status: RemoteStatus) {
        self.status.lock().unwrap().insert(remote_id.to_string(), status);
    }

    /// Publish a status observed outside a recovery pass, e.g. the result of
    /// a manually-triggered `Core::connect`/`Core::disconnect`.
    pub fn set_status_external(&self, remote_id: &str, status: RemoteStatus) {
        self.set_status(remote_id, status);
    }

    pub fn indicator(&self) -> Option<RecoveryIndicator> {
        let tasks = self.reconnect_tasks.lock().unwrap();
        if tasks.is_empty() && !self.preflight_active.load(Ordering::SeqCst) && !self.burst_active.load(Ordering::SeqCst) {
            return None;
        }
        Some(RecoveryIndicator {
            reason: if self.preflight_active.load(Ordering::SeqCst) { "wake-preflight".into() } else { "recovery".into() },
            started_at: std::time::SystemTime::now(),
            pending_remote_count: self.desired.lock().unwrap().len(),
            scheduled_reconnect_count: tasks.len(),
        })
    }

    /// Compute `desired_connections` from the persisted auto-connect flag.
    pub async fn load(&self) -> Result<(), CoreError> {
        let remotes = self.remote_store.load().await?;
        let mut desired = self.desired.lock().unwrap();
        desired.clear();
        for remote in &remotes {
            if remote.auto_connect_on_launch {
                desired.insert(remote.id.clone());
            }
        }
        Ok(())
    }

    async fn remotes(&self) -> Vec<RemoteConfig> {
        self.remote_store.load().await.unwrap_or_default()
    }

    fn remote_counters_snapshot(&self, remote_id: &str) -> (u32, u32) {
        let counters = self.counters.lock().unwrap();
        let c = counters.get(remote_id);
        (c.map(|c| c.preserve_miss).unwrap_or(0), c.map(|c| c.non_connected_strikes).unwrap_or(0))
    }

    // --- Lifecycle triggers ----------------------------------------------

    pub fn on_will_sleep(&self) {
        self.sleeping.store(true, Ordering::SeqCst);
        self.operations.cancel_all();
        self.cancel_all_reconnect_tasks();
    }

    pub async fn on_did_wake(self: &Arc<Self>) {
        self.sleeping.store(false, Ordering::SeqCst);
        self.preflight_active.store(true, Ordering::SeqCst);
        self.operations.cancel_all();
        self.cancel_all_reconnect_tasks();

        let desired: Vec<RemoteId> = self.desired.lock().unwrap().iter().cloned().collect();
        let remotes = self.remotes().await;

        let mut handles = Vec::new();
        for id in &desired {
            if let Some(remote) = remotes.iter().find(|r| &r.id == id).cloned() {
                let mount_manager = self.mount_manager.clone();
                handles.push(tokio::spawn(async move {
                    let _ = mount_manager.force_stop_helpers(&remote, ForceStopOptions { aggressive: true, skip_force_unmount: false }).await;
                }));
            }
        }
        for h in handles {
            let _ = h.await;
        }
        for id in &desired {
            self.set_status(id, RemoteStatus::disconnected());
        }
        self.diagnostics.append(DiagnosticLevel::Info, "recovery", "wake preflight complete, scheduling recovery burst");

        self.preflight_active.store(false, Ordering::SeqCst);
        self.run_burst(RecoveryPassTrigger::Wake, WAKE_BURST_OFFSETS).await;
    }

    pub async fn on_network_became_reachable(self: &Arc<Self>) {
        self.network_reachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(NETWORK_DEBOUNCE).await;
        if !self.network_reachable.load(Ordering::SeqCst) {
            return;
        }
        self.run_startup_auto_connect().await;
        self.run_burst(RecoveryPassTrigger::NetworkRestored, NETWORK_BURST_OFFSETS).await;
    }

    pub fn on_network_became_unreachable(&self) {
        self.network_reachable.store(false, Ordering::SeqCst);
        self.cancel_all_reconnect_tasks();
    }

    pub fn on_external_unmount(self: &Arc<Self>, remote_id: &str) {
        if self.preflight_active.load(Ordering::SeqCst) {
            return;
        }
        if !self.desired.lock().unwrap().contains(remote_id) {
            return;
        }
        self.set_status(remote_id, RemoteStatus::disconnected());
        self.diagnostics.append(DiagnosticLevel::Warning, "recovery", format!("{remote_id} was unmounted externally, scheduling reconnect"));
        self.schedule_reconnect(remote_id.to_string(), RecoveryPassTrigger::Other, true);
    }

    /// Drive one periodic tick. Skips the expensive refresh pass when every
    /// desired remote is already connected, nothing is scheduled, and the
    /// last periodic probe was recent enough.
    pub async fn run_periodic_tick(self: &Arc<Self>) {
        if self.sleeping.load(Ordering::SeqCst) || self.preflight_active.load(Ordering::SeqCst) || self.burst_active.load(Ordering::SeqCst) {
            return;
        }

        let desired: Vec<RemoteId> = self.desired.lock().unwrap().iter().cloned().collect();
        let all_connected = desired.iter().all(|id| self.status(id).state == ConnectionState::Connected);
        let no_reconnects = self.reconnect_tasks.lock().unwrap().is_empty();
        let no_active_ops = desired.iter().all(|id| !self.operations.is_busy(id));
        let recent_probe = self
            .last_periodic_probe_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed() < HEALTHY_PROBE_INTERVAL)
            .unwrap_or(false);

        if all_connected && no_reconnects && no_active_ops && recent_probe {
            return;
        }

        *self.last_periodic_probe_at.lock().unwrap() = Some(Instant::now());
        self.recovery_pass(RecoveryPassTrigger::Periodic).await;
    }

    /// Spawn a background task ticking [`Self::run_periodic_tick`] on
    /// `interval` until the returned handle is aborted.
    pub fn spawn_periodic_timer(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                this.run_periodic_tick().await;
            }
        })
    }

    async fn run_burst(self: &Arc<Self>, trigger: RecoveryPassTrigger, offsets: &'static [Duration]) {
        self.burst_active.store(true, Ordering::SeqCst);
        for offset in offsets {
            tokio::time::sleep(*offset).await;
            if self.sleeping.load(Ordering::SeqCst) {
                break;
            }
            self.recovery_pass(trigger).await;
        }
        self.burst_active.store(false, Ordering::SeqCst);
    }

    // --- Recovery pass -----------------------------------------------------

    async fn recovery_pass(self: &Arc<Self>, trigger: RecoveryPassTrigger) {
        let desired: Vec<RemoteId> = self.desired.lock().unwrap().iter().cloned().collect();
        let remotes = self.remotes().await;

        for id in &desired {
            let current = self.status(id);
            if matches!(current.state, ConnectionState::Connecting | ConnectionState::Disconnecting) {
                continue;
            }
            let Some(remote) = remotes.iter().find(|r| &r.id == id).cloned() else { continue };

            let (preserve_miss, _) = self.remote_counters_snapshot(id);
            let mount_manager = self.mount_manager.clone();
            let rx = self.operations.submit(id.clone(), OperationIntent::Refresh, OperationTrigger::Recovery, ConflictPolicy::SkipIfBusy, move |_cancel| {
                let current = current.clone();
                async move { mount_manager.refresh_status(&remote, &current, preserve_miss).await.map(|o| o.status) }
            });

            let Ok(rx) = rx else { continue };
            let result = rx.await;

            let mut counters = self.counters.lock().unwrap();
            let entry = counters.entry(id.clone()).or_default();
            entry.last_recovery_refresh_at = Some(Instant::now());

            match result {
                Ok(Ok(status)) => {
                    let connected = status.state == ConnectionState::Connected;
                    self.set_status(id, status);
                    if connected {
                        entry.non_connected_strikes = 0;
                    } else {
                        entry.non_connected_strikes += 1;
                    }
                }
                _ => {
                    entry.non_connected_strikes += 1;
                }
            }
        }

        for id in &desired {
            if self.status(id).state == ConnectionState::Connected {
                continue;
            }
            let strikes = self.counters.lock().unwrap().get(id).map(|c| c.non_connected_strikes).unwrap_or(0);
            if strikes < required_strikes(trigger) {
                continue;
            }
            let status = self.status(id);
            if let Some(err) = &status.last_error {
                if looks_permanent(err) {
                    continue;
                }
            }
            if self.reconnect_tasks.lock().unwrap().contains_key(id) {
                continue;
            }
            self.schedule_reconnect(id.clone(), trigger, true);
        }
    }

    // --- Reconnect scheduling ----------------------------------------------

    fn schedule_reconnect(self: &Arc<Self>, remote_id: RemoteId, trigger: RecoveryPassTrigger, is_transient: bool) {
        let attempt = {
            let mut counters = self.counters.lock().unwrap();
            let entry = counters.entry(remote_id.clone()).or_default();
            let attempt = entry.reconnect_attempts;
            entry.reconnect_attempts += 1;
            attempt
        };
        let delay = backoff_delay(trigger, attempt, is_transient);

        let this = self.clone();
        let id_for_task = remote_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.run_reconnect_attempt(id_for_task).await;
        });
        self.reconnect_tasks.lock().unwrap().insert(remote_id, handle);
    }

    async fn run_reconnect_attempt(self: Arc<Self>, remote_id: RemoteId) {
        self.reconnect_tasks.lock().unwrap().remove(&remote_id);

        if self.sleeping.load(Ordering::SeqCst) || !self.network_reachable.load(Ordering::SeqCst) {
            return;
        }
        if !self.desired.lock().unwrap().contains(&remote_id) {
            return;
        }
        if self.status(&remote_id).state == ConnectionState::Connected {
            return;
        }

        let remotes = self.remotes().await;
        let Some(remote) = remotes.iter().find(|r| r.id == remote_id).cloned() else { return };

        let (preserve_miss, _) = self.remote_counters_snapshot(&remote_id);
        let current = self.status(&remote_id);
        let mount_manager = self.mount_manager.clone();
        let remote_for_refresh = remote.clone();
        if let Ok(rx) = self.operations.submit(remote_id.clone(), OperationIntent::Refresh, OperationTrigger::Recovery, ConflictPolicy::SkipIfBusy, move |_cancel| {
            let current = current.clone();
            async move { mount_manager.refresh_status(&remote_for_refresh, &current, preserve_miss).await.map(|o| o.status) }
        }) {
            if let Ok(Ok(status)) = rx.await {
                let connected = status.state == ConnectionState::Connected;
                self.set_status(&remote_id, status);
                if connected {
                    self.clear_counters(&remote_id);
                    return;
                }
            }
        }

        let password = match self.password.resolve(&remote_id, None).await {
            Ok(pw) => pw,
            Err(_) => None,
        };
        if let Some(pw) = password.as_deref() {
            self.diagnostics.register_secret(pw);
        }

        let mount_manager = self.mount_manager.clone();
        let remote_for_connect = remote.clone();
        let this = self.clone();
        let id_for_cb = remote_id.clone();
        let on_transition = move |status: RemoteStatus| {
            this.set_status(&id_for_cb, status);
        };
        if let Ok(rx) = self.operations.submit(remote_id.clone(), OperationIntent::Connect, OperationTrigger::Recovery, ConflictPolicy::SkipIfBusy, move |_cancel| async move {
            mount_manager.connect(&remote_for_connect, password.as_deref(), &on_transition).await
        }) {
            match rx.await {
                Ok(Ok(status)) => {
                    self.set_status(&remote_id, status);
                    self.clear_counters(&remote_id);
                }
                Ok(Err(e)) => {
                    let message = e.user_message();
                    self.set_status(&remote_id, RemoteStatus::error(message.clone()));
                    if e.stops_auto_reconnect() || looks_permanent(&message) {
                        self.desired.lock().unwrap().remove(&remote_id);
                        self.clear_counters(&remote_id);
                    } else {
                        self.schedule_reconnect(remote_id, RecoveryPassTrigger::Other, e.is_transient());
                    }
                }
                Err(_) => {}
            }
        }
    }

    fn clear_counters(&self, remote_id: &str) {
        self.counters.lock().unwrap().remove(remote_id);
    }

    fn cancel_all_reconnect_tasks(&self) {
        let mut tasks = self.reconnect_tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    // --- Startup auto-connect ------------------------------------------------

    pub async fn run_startup_auto_connect(self: &Arc<Self>) {
        if !self.network_reachable.load(Ordering::SeqCst) {
            let desired = self.desired.lock().unwrap().clone();
            self.pending_startup_auto_connect_ids.lock().unwrap().extend(desired);
            return;
        }

        let pending: Vec<RemoteId> = {
            let mut pending = self.pending_startup_auto_connect_ids.lock().unwrap();
            if pending.is_empty() {
                self.desired.lock().unwrap().iter().cloned().collect()
            } else {
                let drained: Vec<RemoteId> = pending.drain().collect();
                drained
            }
        };

        let remotes = self.remotes().await;

        use crate::model::AuthMode;
        for id in &pending {
            if let Some(remote) = remotes.iter().find(|r| &r.id == id) {
                if remote.auth_mode == AuthMode::Password {
                    let _ = self.password.resolve(id, None).await;
                }
            }
        }

        let mut handles = Vec::new();
        for id in pending {
            let Some(remote) = remotes.iter().find(|r| r.id == id).cloned() else { continue };
            let this = self.clone();
            let remote_id = remote.id.clone();
            handles.push(tokio::spawn(async move {
                let password = this.password.resolve(&remote_id, None).await.unwrap_or(None);
                if let Some(pw) = password.as_deref() {
                    this.diagnostics.register_secret(pw);
                }
                let mount_manager = this.mount_manager.clone();
                let this2 = this.clone();
                let id_for_cb = remote_id.clone();
                let on_transition = move |status: RemoteStatus| {
                    this2.set_status(&id_for_cb, status);
                };
                let submitted = this.operations.submit(remote_id.clone(), OperationIntent::Connect, OperationTrigger::Startup, ConflictPolicy::SkipIfBusy, move |_cancel| async move {
                    mount_manager.connect(&remote, password.as_deref(), &on_transition).await
                });
                if let Ok(rx) = submitted {
                    match rx.await {
                        Ok(Ok(status)) => this.set_status(&remote_id, status),
                        Ok(Err(e)) => this.set_status(&remote_id, RemoteStatus::error(e.user_message())),
                        Err(_) => {}
                    }
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }
}
