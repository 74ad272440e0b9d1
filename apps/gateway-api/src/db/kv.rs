use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Failure reported by a key-value backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Abstraction over the shared hash-map service that backs the session registry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set `field` of hash `key`, overwriting any previous value.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    /// Set `field` only if it is not present. Returns whether the write happened.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single process / tests)
// ---------------------------------------------------------------------------

pub struct MemoryStore {
    data: Mutex<HashMap<String, HashMap<String, String>>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate the backend becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.data
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.data.lock();
        let hash = data.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.check()?;
        if let Some(hash) = self.data.lock().get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hset_nx_only_writes_once() {
        let store = MemoryStore::new();
        assert!(store.hset_nx("h", "a", "1").await.unwrap());
        assert!(!store.hset_nx("h", "a", "2").await.unwrap());
        assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn hdel_missing_field_is_noop() {
        let store = MemoryStore::new();
        store.hdel("h", "missing").await.unwrap();
        assert!(store.hgetall("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_store_rejects_every_call() {
        let store = MemoryStore::new();
        store.hset("h", "a", "1").await.unwrap();
        store.set_offline(true);
        assert!(matches!(store.hget("h", "a").await, Err(StoreError::Unavailable(_))));
        assert!(store.hgetall("h").await.is_err());
        store.set_offline(false);
        assert_eq!(store.hgetall("h").await.unwrap().len(), 1);
    }
}
