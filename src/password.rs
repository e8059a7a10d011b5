//! 4.I Password Resolver: funnels secret access through a cache to avoid
//! prompt storms.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::error::CoreError;
use crate::model::RemoteId;
use crate::traits::SecretStore;

fn fingerprint(password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

pub struct PasswordResolver {
    secret_store: Arc<dyn SecretStore>,
    cache: Mutex<HashMap<RemoteId, String>>,
    /// SHA-256 of the cached password, never the password itself, so a
    /// caller can detect "the resolved credential changed" for diagnostics
    /// without handling the plaintext a second time.
    fingerprints: Mutex<HashMap<RemoteId, [u8; 32]>>,
    /// Interactive prompting policy. Off by default in background flows;
    /// the embedding application is the only caller that should ever flip
    /// this on, for an explicit user-initiated unlock.
    allow_interactive: bool,
}

impl PasswordResolver {
    pub fn new(secret_store: Arc<dyn SecretStore>) -> Self {
        Self { secret_store, cache: Mutex::new(HashMap::new()), fingerprints: Mutex::new(HashMap::new()), allow_interactive: false }
    }

    pub fn with_interactive_prompting(mut self, allow: bool) -> Self {
        self.allow_interactive = allow;
        self
    }

    /// Resolve a password for `remote_id`: an explicit non-empty draft wins,
    /// then the cache, then a secret-store read off the caller's task (so a
    /// slow Keychain prompt never blocks the control actor).
    pub async fn resolve(&self, remote_id: &str, draft: Option<&str>) -> Result<Option<String>, CoreError> {
        if let Some(draft) = draft {
            if !draft.is_empty() {
                self.cache.lock().unwrap().insert(remote_id.to_string(), draft.to_string());
                self.fingerprints.lock().unwrap().insert(remote_id.to_string(), fingerprint(draft));
                return Ok(Some(draft.to_string()));
            }
        }

        if let Some(cached) = self.cache.lock().unwrap().get(remote_id).cloned() {
            return Ok(Some(cached));
        }

        let store = self.secret_store.clone();
        let id = remote_id.to_string();
        let interactive = self.allow_interactive;
        let value = tokio::spawn(async move { store.read(&id, interactive).await })
            .await
            .map_err(|_| CoreError::Cancelled)??;

        if let Some(v) = &value {
            if !v.is_empty() {
                self.cache.lock().unwrap().insert(remote_id.to_string(), v.clone());
                self.fingerprints.lock().unwrap().insert(remote_id.to_string(), fingerprint(v));
            }
        }
        Ok(value)
    }

    /// Drop the cached entry for a remote that was deleted or whose auth
    /// mode changed.
    pub fn invalidate(&self, remote_id: &str) {
        self.cache.lock().unwrap().remove(remote_id);
        self.fingerprints.lock().unwrap().remove(remote_id);
    }

    pub fn is_cached(&self, remote_id: &str) -> bool {
        self.cache.lock().unwrap().contains_key(remote_id)
    }

    /// True if `candidate` differs from the currently cached password for
    /// `remote_id` (or nothing is cached yet). Used to decide whether a
    /// freshly-typed draft is worth re-resolving before overwriting a good
    /// cache entry.
    pub fn credential_changed(&self, remote_id: &str, candidate: &str) -> bool {
        match self.fingerprints.lock().unwrap().get(remote_id) {
            Some(existing) => *existing != fingerprint(candidate),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeSecretStore;

    #[tokio::test]
    async fn draft_takes_priority_and_populates_cache() {
        let resolver = PasswordResolver::new(Arc::new(FakeSecretStore::new()));
        let pw = resolver.resolve("r1", Some("draft-pw")).await.unwrap();
        assert_eq!(pw, Some("draft-pw".to_string()));
        assert!(resolver.is_cached("r1"));
    }

    #[tokio::test]
    async fn cache_avoids_a_second_store_read() {
        let store = Arc::new(FakeSecretStore::new());
        store.set("r1", "stored-pw");
        let resolver = PasswordResolver::new(store.clone());

        let first = resolver.resolve("r1", None).await.unwrap();
        assert_eq!(first, Some("stored-pw".to_string()));
        assert_eq!(store.read_count("r1"), 1);

        let second = resolver.resolve("r1", None).await.unwrap();
        assert_eq!(second, Some("stored-pw".to_string()));
        assert_eq!(store.read_count("r1"), 1, "second resolve must hit the cache, not the store");
    }

    #[tokio::test]
    async fn invalidate_clears_cache_forcing_a_reread() {
        let store = Arc::new(FakeSecretStore::new());
        store.set("r1", "stored-pw");
        let resolver = PasswordResolver::new(store.clone());
        resolver.resolve("r1", None).await.unwrap();
        resolver.invalidate("r1");
        assert!(!resolver.is_cached("r1"));
        resolver.resolve("r1", None).await.unwrap();
        assert_eq!(store.read_count("r1"), 2);
    }

    #[tokio::test]
    async fn credential_changed_detects_a_different_draft() {
        let resolver = PasswordResolver::new(Arc::new(FakeSecretStore::new()));
        resolver.resolve("r1", Some("first-pw")).await.unwrap();
        assert!(!resolver.credential_changed("r1", "first-pw"));
        assert!(resolver.credential_changed("r1", "second-pw"));
        assert!(resolver.credential_changed("r2", "anything"));
    }

    #[tokio::test]
    async fn reads_are_non_interactive_by_default() {
        let store = Arc::new(FakeSecretStore::new());
        store.set("r1", "stored-pw");
        let resolver = PasswordResolver::new(store.clone());
        resolver.resolve("r1", None).await.unwrap();
        assert_eq!(store.last_interactive_flag("r1"), Some(false));
    }
}
