//! 4.G Operations Engine: one active operation slot per remote, conflict
//! policy enforcement, a global concurrency cap, and a per-operation
//! watchdog.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{oneshot, Semaphore};

use crate::config::{op_timeout, GLOBAL_MAX_CONCURRENT_DEFAULT, STALLED_REPLACE_THRESHOLD};
use crate::error::CoreError;
use crate::model::{ConflictPolicy, OperationIntent, OperationTrigger, RemoteId, RemoteStatus};

/// Shared with the closure an admitted operation runs: the closure must
/// check this before publishing any status write, since a cancelled or
/// superseded operation's writes must never reach the status map.
pub type CancelFlag = Arc<AtomicBool>;

struct ActiveOp {
    id: u64,
    intent: OperationIntent,
    started_at: Instant,
    cancel_tx: Option<oneshot::Sender<()>>,
    cancelled: CancelFlag,
}

/// Outcome returned by [`OperationsEngine::submit`]'s receiver: either the
/// operation's own result, or `Cancelled` if it was superseded/cancelled
/// before completing.
pub type OpResult = Result<RemoteStatus, CoreError>;

pub struct OperationsEngine {
    limiter: Arc<Semaphore>,
    slots: Arc<Mutex<HashMap<RemoteId, ActiveOp>>>,
    next_id: AtomicU64,
}

impl OperationsEngine {
    pub fn new() -> Self {
        Self::with_capacity(GLOBAL_MAX_CONCURRENT_DEFAULT)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { limiter: Arc::new(Semaphore::new(capacity)), slots: Arc::new(Mutex::new(HashMap::new())), next_id: AtomicU64::new(1) }
    }

    /// Try to admit a new operation for `remote_id`. `work` receives a
    /// [`CancelFlag`] it must consult before every status write and is run
    /// once the global limiter grants a permit. Returns a receiver that
    /// resolves to the operation's outcome once it finishes, is cancelled,
    /// or is superseded.
    pub fn submit<F, Fut>(
        &self,
        remote_id: RemoteId,
        intent: OperationIntent,
        trigger: OperationTrigger,
        policy: ConflictPolicy,
        work: F,
    ) -> Result<oneshot::Receiver<OpResult>, CoreError>
    where
        F: FnOnce(CancelFlag) -> Fut + Send + 'static,
        Fut: Future<Output = OpResult> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        {
            let mut slots = self.slots.lock().unwrap();
            if let Some(existing) = slots.get_mut(&remote_id) {
                match policy {
                    ConflictPolicy::SkipIfBusy => {
                        let stalled = existing.started_at.elapsed() >= STALLED_REPLACE_THRESHOLD;
                        let compatible_replace = stalled
                            && matches!(trigger, OperationTrigger::Recovery | OperationTrigger::Startup)
                            && intent == OperationIntent::Connect
                            && matches!(existing.intent, OperationIntent::Connect | OperationIntent::Refresh);
                        if !compatible_replace {
                            return Err(CoreError::Busy(vec![]));
                        }
                        Self::cancel_locked(existing);
                    }
                    ConflictPolicy::LatestIntentWins => {
                        Self::cancel_locked(existing);
                    }
                }
            }
            slots.insert(remote_id.clone(), ActiveOp { id, intent, started_at: Instant::now(), cancel_tx: Some(cancel_tx), cancelled: cancelled.clone() });
        }

        let (result_tx, result_rx) = oneshot::channel();
        let limiter = self.limiter.clone();
        let slots = self.slots.clone();
        let timeout = op_timeout(intent);
        let remote_for_task = remote_id.clone();

        tokio::spawn(async move {
            let _permit = limiter.acquire_owned().await;
            let work_fut = work(cancelled.clone());
            tokio::pin!(work_fut);
            let mut cancel_rx = cancel_rx;
            let sleep = tokio::time::sleep(timeout);
            tokio::pin!(sleep);

            let outcome: OpResult = tokio::select! {
                res = &mut work_fut => res,
                _ = &mut cancel_rx => Err(CoreError::Cancelled),
                _ = &mut sleep => {
                    cancelled.store(true, Ordering::SeqCst);
                    Err(CoreError::timeout(format!("operation watchdog fired after {timeout:?}")))
                }
            };

            {
                let mut guard = slots.lock().unwrap();
                if matches!(guard.get(&remote_for_task), Some(active) if active.id == id) {
                    guard.remove(&remote_for_task);
                }
            }

            let _ = result_tx.send(outcome);
        });

        Ok(result_rx)
    }

    fn cancel_locked(existing: &mut ActiveOp) {
        existing.cancelled.store(true, Ordering::SeqCst);
        if let Some(tx) = existing.cancel_tx.take() {
            let _ = tx.send(());
        }
    }

    /// True if a remote currently has an active operation.
    pub fn is_busy(&self, remote_id: &str) -> bool {
        self.slots.lock().unwrap().contains_key(remote_id)
    }

    /// How long the current operation for a remote has been running, if any.
    pub fn running_for(&self, remote_id: &str) -> Option<std::time::Duration> {
        self.slots.lock().unwrap().get(remote_id).map(|op| op.started_at.elapsed())
    }

    /// Cancel every active operation, e.g. on application shutdown or
    /// system will-sleep.
    pub fn cancel_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        for (_, op) in slots.iter_mut() {
            Self::cancel_locked(op);
        }
        slots.clear();
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl Default for OperationsEngine {
    fn default() -> Self {
        Self::new()
    }
}
