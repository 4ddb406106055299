use crate::errors::ProxyError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Deadline applied to every store operation.
const STORE_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation failed: {0}")]
    Backend(String),
    #[error("store operation timed out")]
    Timeout,
}

/// Pluggable refresh-token storage, keyed by the hash of the access token.
///
/// Backends are selected by URL scheme; the crate ships the in-memory one and
/// external backends (redis, boltdb) are injected through
/// [`crate::server::ProxyServer`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn close(&self) {}
}

/// Best-effort write; a failing or slow store must not fail the request.
pub async fn set_with_deadline(
    store: &dyn SessionStore,
    key: &str,
    value: &str,
    ttl: Duration,
) {
    let result = tokio::time::timeout(STORE_DEADLINE, store.set(key, value, ttl)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("session store write failed: {}", err),
        Err(_) => log::warn!("session store write timed out"),
    }
}

/// A read that times out degrades to not-found, forcing a fresh login.
pub async fn get_with_deadline(store: &dyn SessionStore, key: &str) -> Option<String> {
    match tokio::time::timeout(STORE_DEADLINE, store.get(key)).await {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            log::warn!("session store read failed: {}", err);
            None
        }
        Err(_) => {
            log::warn!("session store read timed out");
            None
        }
    }
}

pub async fn delete_with_deadline(store: &dyn SessionStore, key: &str) {
    match tokio::time::timeout(STORE_DEADLINE, store.delete(key)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("session store delete failed: {}", err),
        Err(_) => log::warn!("session store delete timed out"),
    }
}

/// Reject store URLs the crate cannot satisfy at startup rather than at the
/// first refresh.
pub fn validate_store_url(url: &str) -> Result<(), ProxyError> {
    match url.split_once("://") {
        Some(("memory", _)) => Ok(()),
        Some((scheme, _)) => Err(ProxyError::ConfigInvalid(format!(
            "store scheme {} requires an externally provided SessionStore implementation",
            scheme
        ))),
        None => Err(ProxyError::ConfigInvalid(format!(
            "invalid store_url: {}",
            url
        ))),
    }
}

/// Build the store named by `store_url`; empty means no store at all (the
/// refresh token then lives in an encrypted cookie).
pub fn create_store(url: &str) -> Result<Option<Arc<dyn SessionStore>>, ProxyError> {
    if url.is_empty() {
        return Ok(None);
    }
    validate_store_url(url)?;
    Ok(Some(Arc::new(MemoryStore::new())))
}

/// In-process store, the default backend.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let now = Instant::now();
        entries.retain(|_, (_, deadline)| *deadline > now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(entries.get(key).and_then(|(value, deadline)| {
            if *deadline > Instant::now() {
                Some(value.clone())
            } else {
                None
            }
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store
            .set("key", "value", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("key").await.unwrap().as_deref(), Some("value"));

        store.delete("key").await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_returned() {
        let store = MemoryStore::new();
        store.set("key", "value", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let store = MemoryStore::new();
        store.set("key", "a", Duration::from_secs(60)).await.unwrap();
        store.set("key", "b", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("key").await.unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_store_url_validation() {
        assert!(validate_store_url("memory://").is_ok());
        assert!(validate_store_url("redis://127.0.0.1:6379").is_err());
        assert!(validate_store_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_create_store_empty_is_none() {
        assert!(create_store("").unwrap().is_none());
        assert!(create_store("memory://").unwrap().is_some());
    }

    mockall::mock! {
        pub Store {}

        #[async_trait]
        impl SessionStore for Store {
            async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
            async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
            async fn delete(&self, key: &str) -> Result<(), StoreError>;
        }
    }

    #[tokio::test]
    async fn test_failing_read_degrades_to_not_found() {
        // Arrange
        let mut store = MockStore::default();
        store
            .expect_get()
            .returning(|_| Err(StoreError::Backend("down".to_string())));

        // Act / Assert
        assert_eq!(get_with_deadline(&store, "key").await, None);
    }

    #[tokio::test]
    async fn test_failing_write_is_swallowed() {
        // Arrange
        let mut store = MockStore::default();
        store
            .expect_set()
            .times(1)
            .returning(|_, _, _| Err(StoreError::Backend("down".to_string())));

        // Act: must not panic or propagate.
        set_with_deadline(&store, "key", "value", Duration::from_secs(1)).await;
    }
}
