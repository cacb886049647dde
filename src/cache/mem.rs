//! Provides an unbounded in-memory store.
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::cache::{CacheValue, CacheWriteError, KeyValueCache};

/// Keeps all values in a map until they are explicitly deleted.
///
/// Entries are never evicted, therefore this is only suitable if the set of cached resources
/// is known to be small. See [LruCache](crate::cache::lru::LruCache) for a bounded store.
pub struct MemCache<V> {
    entries: Mutex<HashMap<String, V>>,
}

impl<V: CacheValue> MemCache<V> {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of stored values.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Determines if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, V>> {
        // Each operation is a single map call, so a poisoned map is still consistent...
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: CacheValue> Default for MemCache<V> {
    fn default() -> Self {
        MemCache::new()
    }
}

#[async_trait]
impl<V: CacheValue> KeyValueCache<V> for MemCache<V> {
    async fn get(&self, key: &str) -> anyhow::Result<Option<V>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: V) -> anyhow::Result<V> {
        if value.is_void() {
            return Err(CacheWriteError::new(key).into());
        }

        let _ = self.lock().insert(key.to_owned(), value.clone());
        Ok(value)
    }

    async fn has(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.lock().contains_key(key))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let _ = self.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.lock().clear();
        Ok(())
    }
}
