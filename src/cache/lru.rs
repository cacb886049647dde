//! Provides a size constrained LRU store.
//!
//! An LRU store behaves just like a map as long as there is no shortage in storage. However, once
//! the max number of entries is reached, old (least recently used) entries will be evicted -
//! hence the name LRU cache.
//!
//! Note that this store doesn't know anything about TTLs. Expired entries are detected and
//! removed by the [CachePolicy](crate::cache::policy::CachePolicy) once they are read.
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use linked_hash_map::LinkedHashMap;

use crate::cache::{CacheValue, CacheWriteError, KeyValueCache};

/// A store which keeps up to **capacity** entries.
///
/// # Examples
/// ```
/// # use courier::cache::KeyValueCache;
/// # use courier::cache::lru::LruCache;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> anyhow::Result<()> {
/// let lru: LruCache<String> = LruCache::new(2);
///
/// lru.set("Foo", "Bar".to_owned()).await?;
/// lru.set("Foo1", "Bar1".to_owned()).await?;
///
/// // Reading "Foo" makes "Foo1" the least recently used entry...
/// assert_eq!(lru.get("Foo").await?, Some("Bar".to_owned()));
///
/// // ..which is therefore evicted once a third entry arrives.
/// lru.set("Foo2", "Bar2".to_owned()).await?;
/// assert_eq!(lru.has("Foo").await?, true);
/// assert_eq!(lru.has("Foo1").await?, false);
/// assert_eq!(lru.has("Foo2").await?, true);
/// # Ok(())
/// # }
/// ```
pub struct LruCache<V> {
    inner: Mutex<Inner<V>>,
}

struct Inner<V> {
    capacity: usize,
    reads: usize,
    hits: usize,
    writes: usize,
    map: LinkedHashMap<String, V>,
}

impl<V: CacheValue> LruCache<V> {
    /// Creates a new store which can hold up to **capacity** entries.
    pub fn new(capacity: usize) -> Self {
        LruCache {
            inner: Mutex::new(Inner {
                capacity,
                reads: 0,
                hits: 0,
                writes: 0,
                map: LinkedHashMap::with_capacity(capacity),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of entries in the store.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    /// Returns to overall capacity (max number of entries) of this store.
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Changes the maximal number of entries permitted in this store.
    ///
    /// Shrinking the store evicts the least recently used entries right away.
    ///
    /// # Examples
    /// ```
    /// # use courier::cache::KeyValueCache;
    /// # use courier::cache::lru::LruCache;
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> anyhow::Result<()> {
    /// let lru: LruCache<String> = LruCache::new(10);
    ///
    /// // Add some entries...
    /// for i in 0..6 {
    ///     lru.set(&format!("Foo{}", i), "Bar".to_owned()).await?;
    /// }
    /// assert_eq!(lru.len(), 6);
    ///
    /// // Now request that the store is reduced to only 3 entries...
    /// lru.set_capacity(3);
    /// assert_eq!(lru.capacity(), 3);
    ///
    /// // ensure that all other entries are gone...
    /// assert_eq!(lru.len(), 3);
    /// assert_eq!(lru.has("Foo5").await?, true);
    /// assert_eq!(lru.has("Foo2").await?, false);
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.lock();
        inner.capacity = capacity;
        inner.enforce_constraints();
    }

    /// Returns the number of reads, hits and writes since the store was created or cleared.
    pub fn metrics(&self) -> (usize, usize, usize) {
        let inner = self.lock();
        (inner.reads, inner.hits, inner.writes)
    }

    /// Returns the hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        let inner = self.lock();
        if inner.reads == 0 {
            0.
        } else {
            inner.hits as f32 * 100. / inner.reads as f32
        }
    }
}

impl<V> Inner<V> {
    fn enforce_constraints(&mut self) {
        while self.map.len() > self.capacity {
            if self.map.pop_front().is_none() {
                break;
            }
        }
    }
}

#[async_trait]
impl<V: CacheValue> KeyValueCache<V> for LruCache<V> {
    async fn get(&self, key: &str) -> anyhow::Result<Option<V>> {
        let mut inner = self.lock();
        inner.reads += 1;

        let value = inner.map.get_refresh(key).cloned();
        if value.is_some() {
            inner.hits += 1;
        }

        Ok(value)
    }

    async fn set(&self, key: &str, value: V) -> anyhow::Result<V> {
        if value.is_void() {
            return Err(CacheWriteError::new(key).into());
        }

        let mut inner = self.lock();
        let _ = inner.map.insert(key.to_owned(), value.clone());
        inner.writes += 1;
        inner.enforce_constraints();

        Ok(value)
    }

    async fn has(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.lock().map.contains_key(key))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner.writes += 1;
        let _ = inner.map.remove(key);

        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner.map.clear();
        inner.reads = 0;
        inner.hits = 0;
        inner.writes = 0;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::lru::LruCache;
    use crate::cache::KeyValueCache;
    use serde_json::{json, Value};

    #[test]
    fn least_recently_used_entries_are_evicted() {
        crate::testing::test_async(async {
            let lru: LruCache<Value> = LruCache::new(3);
            for key in ["a", "b", "c"] {
                let _ = lru.set(key, json!(key)).await.unwrap();
            }

            // Touch "a" so that "b" becomes the oldest entry...
            assert_eq!(lru.get("a").await.unwrap(), Some(json!("a")));
            let _ = lru.set("d", json!("d")).await.unwrap();

            assert_eq!(lru.len(), 3);
            assert_eq!(lru.has("a").await.unwrap(), true);
            assert_eq!(lru.has("b").await.unwrap(), false);
            assert_eq!(lru.has("c").await.unwrap(), true);
            assert_eq!(lru.has("d").await.unwrap(), true);

            // Overwriting an entry doesn't grow the store...
            let _ = lru.set("c", json!("C")).await.unwrap();
            assert_eq!(lru.len(), 3);
            assert_eq!(lru.get("c").await.unwrap(), Some(json!("C")));
        });
    }

    #[test]
    fn metrics_are_tracked_and_reset() {
        crate::testing::test_async(async {
            let lru: LruCache<Value> = LruCache::new(8);
            let _ = lru.set("a", json!(1)).await.unwrap();
            let _ = lru.get("a").await.unwrap();
            let _ = lru.get("b").await.unwrap();

            assert_eq!(lru.metrics(), (2, 1, 1));
            assert_eq!(lru.hit_rate(), 50.);

            lru.clear().await.unwrap();
            assert_eq!(lru.is_empty(), true);
            assert_eq!(lru.metrics(), (0, 0, 0));
        });
    }

    #[test]
    fn void_values_are_rejected() {
        crate::testing::test_async(async {
            let lru: LruCache<Value> = LruCache::new(8);
            assert_eq!(lru.set("a", Value::Null).await.is_err(), true);
            assert_eq!(lru.is_empty(), true);
        });
    }
}
