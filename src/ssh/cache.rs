//! Connection cache
//!
//! Keeps one live session and one SFTP handle per [`ConnectionIdentity`] so that
//! repeated operations against a host reuse the same transport. Creation is
//! serialized per identity: concurrent callers wait on the same cell and at
//! most one of them runs the connect.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::OnceCell;
use tracing::debug;

use super::backend::{RemoteSession, SftpClient};
use crate::error::Result;

/// Cache key: remote address plus remote user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    pub remote_addr: String,
    pub remote_user: String,
}

impl ConnectionIdentity {
    pub fn new(remote_addr: impl Into<String>, remote_user: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            remote_user: remote_user.into(),
        }
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}__{}__", self.remote_addr, self.remote_user)
    }
}

type Slot<T> = Arc<OnceCell<Arc<T>>>;

/// Keyed registry with per-identity, at-most-once creation
pub struct Registry<T: ?Sized> {
    entries: Mutex<HashMap<ConnectionIdentity, Slot<T>>>,
}

impl<T: ?Sized + Send + Sync> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, identity: &ConnectionIdentity) -> Slot<T> {
        self.lock()
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionIdentity, Slot<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached entry, if one has been created
    pub fn get(&self, identity: &ConnectionIdentity) -> Option<Arc<T>> {
        self.lock()
            .get(identity)
            .and_then(|slot| slot.get().cloned())
    }

    /// Return the cached entry or run `create` and cache its result.
    ///
    /// A failed `create` caches nothing; the next caller tries again.
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        identity: &ConnectionIdentity,
        create: F,
    ) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<T>>>,
    {
        let slot = self.slot(identity);
        match slot.get_or_try_init(create).await {
            Ok(value) => Ok(value.clone()),
            Err(e) => {
                let mut entries = self.lock();
                if let Some(current) = entries.get(identity) {
                    if Arc::ptr_eq(current, &slot) && !current.initialized() {
                        entries.remove(identity);
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop the entry for `identity`. Removing an absent entry is a no-op.
    pub fn remove(&self, identity: &ConnectionIdentity) -> Option<Arc<T>> {
        self.lock()
            .remove(identity)
            .and_then(|slot| slot.get().cloned())
    }

    /// Drop the entry for `identity` only if its current value matches `stale`.
    /// The check and the removal happen under one lock, so a value cached by
    /// another caller in the meantime is left alone.
    pub fn remove_if<F>(&self, identity: &ConnectionIdentity, stale: F) -> Option<Arc<T>>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut entries = self.lock();
        let value = entries.get(identity).and_then(|slot| slot.get().cloned())?;
        if !stale(&*value) {
            return None;
        }
        entries.remove(identity);
        Some(value)
    }

    pub fn contains(&self, identity: &ConnectionIdentity) -> bool {
        self.lock()
            .get(identity)
            .is_some_and(|slot| slot.initialized())
    }

    /// Number of created entries
    pub fn len(&self) -> usize {
        self.lock().values().filter(|s| s.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized + Send + Sync> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Session and SFTP registries. Inject one per application, or share
/// [`ConnectionCache::global`].
#[derive(Default)]
pub struct ConnectionCache {
    sessions: Registry<dyn RemoteSession>,
    sftp: Registry<dyn SftpClient>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance
    pub fn global() -> Arc<ConnectionCache> {
        static GLOBAL: OnceLock<Arc<ConnectionCache>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ConnectionCache::new())).clone()
    }

    pub fn sessions(&self) -> &Registry<dyn RemoteSession> {
        &self.sessions
    }

    pub fn sftp(&self) -> &Registry<dyn SftpClient> {
        &self.sftp
    }

    /// Remove `identity` from both registries
    pub fn remove(&self, identity: &ConnectionIdentity) {
        debug!("Evicting {} from connection cache", identity);
        self.sessions.remove(identity);
        self.sftp.remove(identity);
    }

    /// Evict the cached session and its SFTP handle if the session matches
    /// `stale`. Returns whether anything was evicted.
    pub fn evict_session_if<F>(&self, identity: &ConnectionIdentity, stale: F) -> bool
    where
        F: FnOnce(&(dyn RemoteSession + 'static)) -> bool,
    {
        if self.sessions.remove_if(identity, stale).is_none() {
            return false;
        }
        debug!("Evicting stale session {} from connection cache", identity);
        self.sftp.remove(identity);
        true
    }
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("sessions", &self.sessions.len())
            .field("sftp", &self.sftp.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn id(addr: &str, user: &str) -> ConnectionIdentity {
        ConnectionIdentity::new(addr, user)
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(id("web01", "deploy").to_string(), "web01__deploy__");
    }

    #[tokio::test]
    async fn test_get_or_insert_reuses_entry() {
        let registry: Registry<String> = Registry::new();
        let calls = AtomicUsize::new(0);

        let first = registry
            .get_or_try_insert_with(&id("h", "u"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new("one".to_string()))
            })
            .await
            .unwrap();
        let second = registry
            .get_or_try_insert_with(&id("h", "u"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new("two".to_string()))
            })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.get(&id("h", "other")).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_creation_runs_once() {
        let registry: Arc<Registry<usize>> = Arc::new(Registry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_or_try_insert_with(&id("h", "u"), || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Arc::new(calls.fetch_add(1, Ordering::SeqCst)))
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(*handle.await.unwrap(), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let registry: Registry<String> = Registry::new();

        let err = registry
            .get_or_try_insert_with(&id("h", "u"), || async {
                Err(TransportError::connection("refused"))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refused"));
        assert!(!registry.contains(&id("h", "u")));
        assert!(registry.is_empty());

        let value = registry
            .get_or_try_insert_with(&id("h", "u"), || async { Ok(Arc::new("ok".to_string())) })
            .await
            .unwrap();
        assert_eq!(*value, "ok");
        assert!(registry.contains(&id("h", "u")));
    }

    #[tokio::test]
    async fn test_remove_if_keeps_replaced_value() {
        let registry: Registry<String> = Registry::new();
        registry
            .get_or_try_insert_with(&id("h", "u"), || async { Ok(Arc::new("fresh".to_string())) })
            .await
            .unwrap();

        // A caller still holding the old value must not evict the new one
        assert!(registry.remove_if(&id("h", "u"), |v| v == "stale").is_none());
        assert_eq!(*registry.get(&id("h", "u")).unwrap(), "fresh");

        let removed = registry.remove_if(&id("h", "u"), |v| v == "fresh").unwrap();
        assert_eq!(*removed, "fresh");
        assert!(registry.is_empty());
        assert!(registry.remove_if(&id("h", "u"), |_| true).is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry: Registry<String> = Registry::new();
        registry
            .get_or_try_insert_with(&id("h", "u"), || async { Ok(Arc::new("x".to_string())) })
            .await
            .unwrap();

        assert!(registry.remove(&id("h", "u")).is_some());
        assert!(registry.remove(&id("h", "u")).is_none());
        assert!(!registry.contains(&id("h", "u")));
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&ConnectionCache::global(), &ConnectionCache::global()));
    }
}
