//! Cache store contract and the in-process implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::StorageError;

/// Namespaced byte cache. Keys are scoped to a namespace so an entity family
/// can be dropped at once with [`Cache::del_ns`].
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn put(&self, ns: &str, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn del(&self, ns: &str, keys: &[&str]) -> Result<(), StorageError>;
    async fn del_ns(&self, ns: &str) -> Result<(), StorageError>;
    async fn has_key(&self, ns: &str, key: &str) -> Result<bool, StorageError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-local cache with a per-entry time to live.
pub struct MemoryCache {
    ttl: Duration,
    namespaces: Mutex<HashMap<String, HashMap<String, Entry>>>,
}

impl MemoryCache {
    /// A zero `ttl` keeps entries until they are invalidated.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            namespaces: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let now = Instant::now();
        let mut namespaces = self.namespaces.lock();
        let Some(entries) = namespaces.get_mut(ns) else {
            return Ok(None);
        };
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, ns: &str, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let expires_at = (!self.ttl.is_zero()).then(|| Instant::now() + self.ttl);
        self.namespaces
            .lock()
            .entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn del(&self, ns: &str, keys: &[&str]) -> Result<(), StorageError> {
        let mut namespaces = self.namespaces.lock();
        if let Some(entries) = namespaces.get_mut(ns) {
            for key in keys {
                entries.remove(*key);
            }
            if entries.is_empty() {
                namespaces.remove(ns);
            }
        }
        Ok(())
    }

    async fn del_ns(&self, ns: &str) -> Result<(), StorageError> {
        self.namespaces.lock().remove(ns);
        Ok(())
    }

    async fn has_key(&self, ns: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(ns, key).await?.is_some())
    }
}
