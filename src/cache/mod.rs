//! Provides the caches used to answer requests without hitting the network.
//!
//! The lowest layer is a [KeyValueCache](KeyValueCache): a plain asynchronous key/value store
//! with string keys. Two implementations are shipped:
//! * [MemCache](mem::MemCache) keeps all entries in a map and never evicts anything.
//! * [LruCache](lru::LruCache) is bounded by a number of entries and drops the least recently
//!   used one once it is full.
//!
//! On top of a store, the [CachePolicy](policy::CachePolicy) enforces TTLs and invalidates
//! dependent resources once a resource is modified. Its rules are described by a
//! [CachePolicyConfig](rules::CachePolicyConfig).
//!
//! # Configuration
//!
//! The store is selected in the **cache** section of the config:
//!
//! ```yaml
//! cache:
//!     # Either "memory" (the default) or "lru".
//!     store: lru
//!     # Number of entries kept by an LRU store.
//!     capacity: 4096
//! ```
//!
//! # Examples
//!
//! ```
//! # use courier::cache::KeyValueCache;
//! # use courier::cache::mem::MemCache;
//! # use serde_json::json;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let cache: MemCache<serde_json::Value> = MemCache::new();
//!
//! cache.set("fish", json!("Wanda")).await?;
//! assert_eq!(cache.get("fish").await?, Some(json!("Wanda")));
//! assert_eq!(cache.has("shark").await?, false);
//!
//! // Null is reserved to signal "no value" and cannot be stored...
//! assert_eq!(cache.set("shark", json!(null)).await.is_err(), true);
//! # Ok(())
//! # }
//! ```
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::Handle;

pub mod lru;
pub mod mem;
pub mod policy;
pub mod rules;

/// Default number of entries kept by an LRU store.
pub const DEFAULT_LRU_CAPACITY: usize = 4096;

/// Describes a value which can be put into a [KeyValueCache](KeyValueCache).
pub trait CacheValue: Clone + Send + Sync + 'static {
    /// Determines if this value is the "nothing" marker of its type.
    ///
    /// Such a value cannot be stored, as it would be indistinguishable from a missing entry.
    fn is_void(&self) -> bool;
}

impl CacheValue for Value {
    fn is_void(&self) -> bool {
        self.is_null()
    }
}

impl CacheValue for String {
    fn is_void(&self) -> bool {
        false
    }
}

/// Represents an entry as stored by the [CachePolicy](policy::CachePolicy).
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    /// The cached response.
    pub value: Value,

    /// The point in time until which the entry may be delivered.
    pub valid_until: Instant,
}

impl CacheEntry {
    /// Determines if the entry may still be delivered.
    pub fn is_valid(&self) -> bool {
        self.valid_until > Instant::now()
    }
}

impl CacheValue for CacheEntry {
    fn is_void(&self) -> bool {
        false
    }
}

/// Signals that a store refused to write a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWriteError {
    key: String,
}

impl CacheWriteError {
    /// Creates an error for the given key.
    pub fn new(key: impl Into<String>) -> Self {
        CacheWriteError { key: key.into() }
    }

    /// Returns the key which was about to be written.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Display for CacheWriteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cannot store an empty value for '{}'. Use 'delete' to remove an entry.",
            self.key
        )
    }
}

impl std::error::Error for CacheWriteError {}

/// Describes an asynchronous key/value store.
///
/// All operations are fallible, so that remote or persistent stores can be plugged in. Note
/// that the in-memory implementations never fail except for **set** being called with a void
/// value, which is rejected with a [CacheWriteError](CacheWriteError).
#[async_trait]
pub trait KeyValueCache<V: CacheValue>: Send + Sync {
    /// Returns the value stored for the given key.
    async fn get(&self, key: &str) -> anyhow::Result<Option<V>>;

    /// Stores the given value and returns it.
    async fn set(&self, key: &str, value: V) -> anyhow::Result<V>;

    /// Determines if a value is present for the given key.
    async fn has(&self, key: &str) -> anyhow::Result<bool>;

    /// Removes the value for the given key. A missing key is no error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Removes all values.
    async fn clear(&self) -> anyhow::Result<()>;
}

/// Creates the store as described by the **cache** section of the given config.
pub fn create_store(config: &Handle) -> anyhow::Result<Arc<dyn KeyValueCache<CacheEntry>>> {
    let store = config.query("cache.store").as_str().unwrap_or("memory");
    match store {
        "memory" => {
            log::info!("Using an unbounded in-memory cache...");
            Ok(Arc::new(mem::MemCache::<CacheEntry>::new()))
        }
        "lru" => {
            let capacity = match config.query("cache.capacity").as_i64() {
                Some(capacity) if capacity > 0 => capacity as usize,
                Some(capacity) => {
                    return Err(anyhow::anyhow!(
                        "Invalid cache capacity: {}. Expected a positive number.",
                        capacity
                    ))
                }
                None => DEFAULT_LRU_CAPACITY,
            };
            log::info!("Using an LRU cache with {} entries...", capacity);
            Ok(Arc::new(lru::LruCache::<CacheEntry>::new(capacity)))
        }
        other => Err(anyhow::anyhow!(
            "Unknown cache store: '{}'. Use either 'memory' or 'lru'.",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::create_store;
    use crate::config::Config;

    #[test]
    fn stores_are_selected_by_config() {
        crate::testing::test_async(async {
            let config = Config::new("unused.yml");
            assert_eq!(create_store(&config.current()).is_ok(), true);

            config
                .load_from_string("cache:\n  store: lru\n  capacity: 12", None)
                .unwrap();
            assert_eq!(create_store(&config.current()).is_ok(), true);

            config
                .load_from_string("cache:\n  store: lru\n  capacity: 0", None)
                .unwrap();
            assert_eq!(create_store(&config.current()).is_err(), true);

            config
                .load_from_string("cache:\n  store: redis", None)
                .unwrap();
            assert_eq!(create_store(&config.current()).is_err(), true);
        });
    }
}
