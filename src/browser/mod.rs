//! 4.F Directory Browser Sessions.

mod session;

pub use session::{BoxFuture, BrowserSession, DirectoryTransport};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::CoreError;
use crate::model::{BrowserConnectionHealth, BrowserSnapshot, RemoteConfig};

/// Opens transports for new sessions. Wire-protocol connection establishment
/// is out of scope for this crate; production code supplies a real
/// implementation (e.g. backed by an SFTP client), tests use
/// [`crate::testutil::FakeTransportFactory`].
pub trait DirectoryTransportFactory: Send + Sync {
    fn open<'a>(&'a self, remote: &'a RemoteConfig, password: Option<&'a str>) -> BoxFuture<'a, Result<Arc<dyn DirectoryTransport>, CoreError>>;
}

/// Owns every open session, keyed by session id. Sessions are created by
/// `open` and removed by `close`; nothing else mutates this map, per the
/// arena+index design note.
pub struct BrowserSessionManager {
    factory: Arc<dyn DirectoryTransportFactory>,
    sessions: RwLock<HashMap<String, BrowserSession>>,
    next_id: AtomicU64,
}

impl BrowserSessionManager {
    pub fn new(factory: Arc<dyn DirectoryTransportFactory>) -> Self {
        Self { factory, sessions: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    pub async fn open(&self, remote: &RemoteConfig, password: Option<&str>) -> Result<String, CoreError> {
        let transport = self.factory.open(remote, password).await?;
        let session = BrowserSession::open(transport);
        let id = format!("{}-{}", remote.id, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sessions.write().unwrap().insert(id.clone(), session);
        Ok(id)
    }

    pub async fn close(&self, session_id: &str) {
        let session = self.sessions.write().unwrap().remove(session_id);
        if let Some(session) = session {
            session.close().await;
        }
    }

    fn get(&self, session_id: &str) -> Result<BrowserSession, CoreError> {
        self.sessions
            .read()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::validation(format!("no open browser session {session_id}")))
    }

    pub async fn list(&self, session_id: &str, path: &str, request_id: u64) -> Result<BrowserSnapshot, CoreError> {
        self.get(session_id)?.list_path(path, request_id).await
    }

    pub async fn go_up(&self, session_id: &str, current: &str, request_id: u64) -> Result<BrowserSnapshot, CoreError> {
        self.get(session_id)?.go_up(current, request_id).await
    }

    pub async fn retry_current(&self, session_id: &str, last_known: &str, request_id: u64) -> Result<BrowserSnapshot, CoreError> {
        self.get(session_id)?.retry_current(last_known, request_id).await
    }

    pub async fn health(&self, session_id: &str) -> Result<BrowserConnectionHealth, CoreError> {
        self.get(session_id)?.health().await
    }

    /// Count of currently open sessions, by health state — used to compose
    /// `Core::summary()`.
    pub async fn summary(&self) -> Vec<(String, BrowserConnectionHealth)> {
        let ids: Vec<String> = self.sessions.read().unwrap().keys().cloned().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(health) = self.health(&id).await {
                out.push((id, health));
            }
        }
        out
    }
}
