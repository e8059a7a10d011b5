//! Single browser session: one worker task serializing requests against one
//! transport, matching the "single-writer per session" rule in 4.F.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use moka::sync::Cache;
use tokio::sync::{mpsc, oneshot};

use crate::config::{BREAKER_FAILURE_THRESHOLD, BREAKER_WINDOW, DIRECTORY_CACHE_CAPACITY, DIRECTORY_CACHE_TTL};
use crate::error::CoreError;
use crate::model::{BrowserConnectionHealth, BrowserHealth, BrowserSnapshot, DirEntry};
use crate::path;

pub use crate::util::BoxFuture;

/// The SFTP-like transport a session drives. Wire-protocol internals are out
/// of scope for this crate; production code supplies a real implementation,
/// tests use [`crate::testutil::FakeDirectoryTransport`].
pub trait DirectoryTransport: Send + Sync {
    fn list_directory<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<DirEntry>, CoreError>>;
}

enum Job {
    List { path: String, request_id: u64, reply: oneshot::Sender<BrowserSnapshot> },
    GoUp { current: String, request_id: u64, reply: oneshot::Sender<BrowserSnapshot> },
    RetryCurrent { last_known: String, request_id: u64, reply: oneshot::Sender<BrowserSnapshot> },
    Health { reply: oneshot::Sender<BrowserConnectionHealth> },
    Close,
}

struct Breaker {
    failures: VecDeque<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self { failures: VecDeque::new() }
    }

    fn record_failure(&mut self) -> bool {
        let now = Instant::now();
        self.failures.push_back(now);
        self.prune(now);
        self.failures.len() as u32 >= BREAKER_FAILURE_THRESHOLD
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.failures.front() {
            if now.duration_since(front) > BREAKER_WINDOW {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn reset(&mut self) {
        self.failures.clear();
    }
}

struct Worker {
    transport: Arc<dyn DirectoryTransport>,
    /// Listings survive a short TTL so a `go_up` immediately followed by a
    /// re-entry into the same directory doesn't re-probe the transport, and
    /// double as the stale fallback a failed probe returns.
    cache: Cache<String, Vec<DirEntry>>,
    health: BrowserConnectionHealth,
    breaker: Breaker,
}

impl Worker {
    async fn handle_probe(&mut self, path: &str, request_id: u64, force: bool) -> BrowserSnapshot {
        let normalized = path::normalize(path);

        if self.health.state == BrowserHealth::Failed && !force {
            return BrowserSnapshot {
                request_id,
                path: normalized,
                entries: vec![],
                health: BrowserHealth::Failed,
                is_stale: true,
                is_confirmed_empty: false,
                message: Some("circuit breaker open: call retry_current to reset".into()),
                latency_ms: 0,
                from_cache: false,
            };
        }

        let started = Instant::now();
        match self.transport.list_directory(&normalized).await {
            Ok(entries) => {
                self.breaker.reset();
                self.health = BrowserConnectionHealth {
                    state: BrowserHealth::Healthy,
                    last_success_at: Some(std::time::SystemTime::now()),
                    last_latency_ms: Some(started.elapsed().as_millis() as u64),
                    last_error: None,
                };
                self.cache.insert(normalized.clone(), entries.clone());
                let confirmed_empty = entries.is_empty();
                BrowserSnapshot {
                    request_id,
                    path: normalized,
                    entries,
                    health: BrowserHealth::Healthy,
                    is_stale: false,
                    is_confirmed_empty: confirmed_empty,
                    message: None,
                    latency_ms: started.elapsed().as_millis() as u64,
                    from_cache: false,
                }
            }
            Err(e) => {
                let tripped = self.breaker.record_failure();
                let new_state = if tripped {
                    BrowserHealth::Failed
                } else if force {
                    BrowserHealth::Reconnecting
                } else {
                    BrowserHealth::Degraded
                };
                self.health = BrowserConnectionHealth {
                    state: new_state,
                    last_success_at: self.health.last_success_at,
                    last_latency_ms: self.health.last_latency_ms,
                    last_error: Some(e.user_message()),
                };

                if let Some(entries) = self.cache.get(&normalized) {
                    BrowserSnapshot {
                        request_id,
                        path: normalized,
                        entries,
                        health: new_state,
                        is_stale: true,
                        is_confirmed_empty: false,
                        message: Some(e.user_message()),
                        latency_ms: started.elapsed().as_millis() as u64,
                        from_cache: true,
                    }
                } else {
                    BrowserSnapshot {
                        request_id,
                        path: normalized,
                        entries: vec![],
                        health: new_state,
                        is_stale: true,
                        is_confirmed_empty: false,
                        message: Some(e.user_message()),
                        latency_ms: started.elapsed().as_millis() as u64,
                        from_cache: false,
                    }
                }
            }
        }
    }
}

/// A live, open directory-browser session. Cheap to clone (`Arc`-backed
/// sender); the only owner of session state is the spawned worker task.
#[derive(Clone)]
pub struct BrowserSession {
    sender: mpsc::Sender<Job>,
}

impl BrowserSession {
    pub fn open(transport: Arc<dyn DirectoryTransport>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(32);
        let cache = Cache::builder().max_capacity(DIRECTORY_CACHE_CAPACITY).time_to_live(DIRECTORY_CACHE_TTL).build();
        let mut worker = Worker { transport, cache, health: BrowserConnectionHealth::new(), breaker: Breaker::new() };

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::List { path, request_id, reply } => {
                        let snapshot = worker.handle_probe(&path, request_id, false).await;
                        let _ = reply.send(snapshot);
                    }
                    Job::GoUp { current, request_id, reply } => {
                        let normalized = path::normalize(&current);
                        let target = path::parent(&normalized).unwrap_or(normalized);
                        let snapshot = worker.handle_probe(&target, request_id, false).await;
                        let _ = reply.send(snapshot);
                    }
                    Job::RetryCurrent { last_known, request_id, reply } => {
                        let snapshot = worker.handle_probe(&last_known, request_id, true).await;
                        let _ = reply.send(snapshot);
                    }
                    Job::Health { reply } => {
                        let _ = reply.send(worker.health.clone());
                    }
                    Job::Close => break,
                }
            }
        });

        Self { sender: tx }
    }

    pub async fn list_path(&self, path: &str, request_id: u64) -> Result<BrowserSnapshot, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Job::List { path: path.to_string(), request_id, reply: tx })
            .await
            .map_err(|_| CoreError::Cancelled)?;
        rx.await.map_err(|_| CoreError::Cancelled)
    }

    pub async fn go_up(&self, current: &str, request_id: u64) -> Result<BrowserSnapshot, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Job::GoUp { current: current.to_string(), request_id, reply: tx })
            .await
            .map_err(|_| CoreError::Cancelled)?;
        rx.await.map_err(|_| CoreError::Cancelled)
    }

    pub async fn retry_current(&self, last_known: &str, request_id: u64) -> Result<BrowserSnapshot, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Job::RetryCurrent { last_known: last_known.to_string(), request_id, reply: tx })
            .await
            .map_err(|_| CoreError::Cancelled)?;
        rx.await.map_err(|_| CoreError::Cancelled)
    }

    pub async fn health(&self) -> Result<BrowserConnectionHealth, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(Job::Health { reply: tx }).await.map_err(|_| CoreError::Cancelled)?;
        rx.await.map_err(|_| CoreError::Cancelled)
    }

    pub async fn close(&self) {
        let _ = self.sender.send(Job::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDirectoryTransport;

    #[tokio::test]
    async fn list_returns_entries_and_caches_them() {
        let transport = Arc::new(FakeDirectoryTransport::with_entries(vec![("a.txt", "/root/a.txt")]));
        let session = BrowserSession::open(transport);
        let snap = session.list_path("/root", 1).await.unwrap();
        assert_eq!(snap.entries.len(), 1);
        assert!(!snap.from_cache);
        assert!(!snap.is_stale);
    }

    #[tokio::test]
    async fn failure_falls_back_to_cache() {
        let transport = Arc::new(FakeDirectoryTransport::with_entries(vec![("a.txt", "/root/a.txt")]));
        let session = BrowserSession::open(transport.clone());
        session.list_path("/root", 1).await.unwrap();
        transport.fail_next(CoreError::Transient("reset".into()));
        let snap = session.list_path("/root", 2).await.unwrap();
        assert!(snap.from_cache);
        assert!(snap.is_stale);
        assert_eq!(snap.entries.len(), 1);
    }

    #[tokio::test]
    async fn breaker_trips_after_threshold_failures() {
        let transport = Arc::new(FakeDirectoryTransport::with_entries(vec![]));
        let session = BrowserSession::open(transport.clone());
        for _ in 0..10 {
            transport.fail_next(CoreError::Transient("reset".into()));
            let _ = session.list_path("/root", 1).await;
        }
        let health = session.health().await.unwrap();
        assert_eq!(health.state, BrowserHealth::Failed);
    }

    #[tokio::test]
    async fn retry_current_forces_probe_even_when_failed() {
        let transport = Arc::new(FakeDirectoryTransport::with_entries(vec![("a.txt", "/root/a.txt")]));
        let session = BrowserSession::open(transport.clone());
        for _ in 0..10 {
            transport.fail_next(CoreError::Transient("reset".into()));
            let _ = session.list_path("/root", 1).await;
        }
        let snap = session.retry_current("/root", 11).await.unwrap();
        assert_eq!(snap.entries.len(), 1);
        let health = session.health().await.unwrap();
        assert_eq!(health.state, BrowserHealth::Healthy);
    }

    #[tokio::test]
    async fn go_up_computes_parent() {
        let transport = Arc::new(FakeDirectoryTransport::with_entries(vec![]));
        let session = BrowserSession::open(transport);
        let snap = session.go_up("/a/b/c", 1).await.unwrap();
        assert_eq!(snap.path, "/a/b");
    }
}
