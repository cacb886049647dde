//! Enforces TTLs and invalidation rules on top of a [KeyValueCache](crate::cache::KeyValueCache).
//!
//! Essentially the policy is a TTL cache for GET requests. In addition it tries to behave in a
//! RESTful manner: once a resource is modified (via **PUT**, **PATCH** or **POST**), the cached
//! representations of the resource itself and of its parent are discarded. Further dependencies
//! can be declared via **contains** rules (see [rules](crate::cache::rules)).
//!
//! Note that writes are not detected when a value is stored but once the cache is consulted for
//! the write request. The [Receiver](crate::protocol::receiver::Receiver) always consults the
//! cache before performing a request, so that the stale entries are gone before the modifying
//! call is even sent.
//!
//! # Examples
//!
//! ```
//! # use courier::cache::CacheEntry;
//! # use courier::cache::mem::MemCache;
//! # use courier::cache::policy::{CacheKey, CachePolicy};
//! # use courier::cache::rules::{CachePolicyConfig, ResourcePolicy};
//! # use courier::request::Method;
//! # use serde_json::json;
//! # use std::sync::Arc;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let config = CachePolicyConfig::new().resource(
//!     "https://example.com",
//!     "/list-fish",
//!     ResourcePolicy::default().contains("/fish"),
//! );
//! let policy = CachePolicy::new(config, Arc::new(MemCache::<CacheEntry>::new()))?;
//!
//! let list = CacheKey::get("https://example.com/list-fish");
//! policy.set(&list, json!(["Wanda"])).await?;
//! assert_eq!(policy.get(&list).await?, Some(json!(["Wanda"])));
//!
//! // Adding a fish invalidates the list...
//! let add = CacheKey::new(Method::Post, "https://example.com/fish");
//! assert_eq!(policy.get(&add).await?, None);
//! assert_eq!(policy.get(&list).await?, None);
//! # Ok(())
//! # }
//! ```
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::time::Instant;

use crate::cache::rules::{compile_pattern, CachePolicyConfig, DEFAULT_TTL};
use crate::cache::{CacheEntry, KeyValueCache};
use crate::fmt::format_duration;
use crate::request::Method;

/// Identifies a cached response by its method and URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The method of the request.
    pub method: Method,

    /// The URL of the request.
    pub url: String,
}

impl CacheKey {
    /// Creates a new key.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        CacheKey {
            method,
            url: url.into(),
        }
    }

    /// Creates a key for a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        CacheKey::new(Method::Get, url)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.method, self.url)
    }
}

/// Invalidates the container once a URL matching the pattern is written to.
struct ContainsRule {
    pattern: Regex,
    container: String,
}

/// Wraps a store into a cache keyed by [CacheKey](CacheKey).
///
/// A policy is immutable. When its config changes, a new policy is created for the same store.
pub struct CachePolicy {
    config: CachePolicyConfig,
    rules: Vec<ContainsRule>,
    store: Arc<dyn KeyValueCache<CacheEntry>>,
}

impl CachePolicy {
    /// Creates a new policy enforcing the given config on the given store.
    ///
    /// # Errors
    /// Fails if one of the **contains** patterns cannot be compiled.
    pub fn new(
        config: CachePolicyConfig,
        store: Arc<dyn KeyValueCache<CacheEntry>>,
    ) -> anyhow::Result<Self> {
        let mut rules = Vec::new();
        for (base_url, paths) in config.resources.iter() {
            for (path, resource) in paths.iter() {
                for pattern in &resource.contains {
                    rules.push(ContainsRule {
                        pattern: compile_pattern(base_url, pattern)?,
                        container: format!("{}{}", base_url, path),
                    });
                }
            }
        }

        Ok(CachePolicy {
            config,
            rules,
            store,
        })
    }

    /// Returns the config enforced by this policy.
    pub fn config(&self) -> &CachePolicyConfig {
        &self.config
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn KeyValueCache<CacheEntry>> {
        &self.store
    }

    /// Determines the TTL of responses for the given URL.
    ///
    /// The first base URL (in declaration order) which prefixes the URL is selected, the
    /// remainder has to match a configured path exactly. If this resource has no TTL, the
    /// default TTL of the policy is used, or [DEFAULT_TTL](DEFAULT_TTL) if there is none.
    ///
    /// # Examples
    ///
    /// ```
    /// # use courier::cache::CacheEntry;
    /// # use courier::cache::mem::MemCache;
    /// # use courier::cache::policy::CachePolicy;
    /// # use courier::cache::rules::{CachePolicyConfig, ResourcePolicy, DEFAULT_TTL};
    /// # use std::sync::Arc;
    /// # use std::time::Duration;
    /// let config = CachePolicyConfig::new().resource(
    ///     "https://example.com",
    ///     "/fish",
    ///     ResourcePolicy::with_ttl(Duration::from_secs(100)),
    /// );
    /// let policy = CachePolicy::new(config, Arc::new(MemCache::<CacheEntry>::new())).unwrap();
    ///
    /// assert_eq!(policy.ttl_for("https://example.com/fish"), Duration::from_secs(100));
    /// assert_eq!(policy.ttl_for("https://example.com/fish/1"), DEFAULT_TTL);
    /// assert_eq!(policy.ttl_for("https://other.com/fish"), DEFAULT_TTL);
    /// ```
    pub fn ttl_for(&self, url: &str) -> Duration {
        self.config
            .resources
            .iter()
            .find(|(base_url, _)| url.starts_with(base_url.as_str()))
            .and_then(|(base_url, paths)| paths.get(&url[base_url.len()..]))
            .and_then(|resource| resource.ttl)
            .or(self.config.ttl)
            .unwrap_or(DEFAULT_TTL)
    }

    /// Lists the URLs whose cached GET responses are discarded once the given URL is written to.
    ///
    /// These are the URL itself, its parent (the URL without its last path segment) and all
    /// containers with a matching **contains** rule. Each URL is reported once.
    ///
    /// # Examples
    ///
    /// ```
    /// # use courier::cache::CacheEntry;
    /// # use courier::cache::mem::MemCache;
    /// # use courier::cache::policy::CachePolicy;
    /// # use courier::cache::rules::{CachePolicyConfig, ResourcePolicy};
    /// # use std::sync::Arc;
    /// let config = CachePolicyConfig::new().resource(
    ///     "https://example.com",
    ///     "/list-fish",
    ///     ResourcePolicy::default().contains("/fish/*"),
    /// );
    /// let policy = CachePolicy::new(config, Arc::new(MemCache::<CacheEntry>::new())).unwrap();
    ///
    /// assert_eq!(
    ///     policy.invalidation_targets("https://example.com/fish/1"),
    ///     vec![
    ///         "https://example.com/fish/1",
    ///         "https://example.com/fish",
    ///         "https://example.com/list-fish"
    ///     ]
    /// );
    /// ```
    pub fn invalidation_targets(&self, url: &str) -> Vec<String> {
        let mut targets = vec![url.to_owned()];

        let parent = drop_last_segment(url);
        if !parent.is_empty() {
            targets.push(parent.to_owned());
        }

        for rule in &self.rules {
            if rule.pattern.is_match(url) {
                targets.push(rule.container.clone());
            }
        }

        let mut unique = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.contains(&target) {
                unique.push(target);
            }
        }

        unique
    }

    /// Looks up the cached response for the given key.
    ///
    /// For **GET**, a valid entry is returned and an expired one is removed. For **PUT**,
    /// **PATCH** and **POST**, this invalidates all dependent entries and never yields a value.
    /// All other methods are never cached.
    pub async fn get(&self, key: &CacheKey) -> anyhow::Result<Option<Value>> {
        match key.method {
            Method::Get => {
                let cache_key = key.to_string();
                match self.store.get(&cache_key).await? {
                    Some(entry) if entry.is_valid() => Ok(Some(entry.value)),
                    Some(_) => {
                        log::debug!("Removing expired entry {}...", &cache_key);
                        self.store.delete(&cache_key).await?;
                        Ok(None)
                    }
                    None => Ok(None),
                }
            }
            method if method.is_write() => {
                self.invalidate(&key.url).await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Discards all cached GET responses which depend on the given URL.
    ///
    /// See [invalidation_targets](CachePolicy::invalidation_targets). All entries are removed
    /// concurrently.
    pub async fn invalidate(&self, url: &str) -> anyhow::Result<()> {
        let keys = self
            .invalidation_targets(url)
            .into_iter()
            .map(|target| CacheKey::get(target).to_string())
            .collect::<Vec<_>>();

        log::debug!("Invalidating {}...", keys.join(", "));
        let _ = futures::future::try_join_all(keys.iter().map(|key| self.store.delete(key))).await?;

        Ok(())
    }

    /// Stores the response for the given key and returns it.
    ///
    /// Only **GET** responses are stored, for any other method the value is simply passed
    /// through. The same happens if the TTL of the URL is zero.
    pub async fn set(&self, key: &CacheKey, value: Value) -> anyhow::Result<Value> {
        if key.method != Method::Get {
            return Ok(value);
        }

        let ttl = self.ttl_for(&key.url);
        if ttl.is_zero() {
            return Ok(value);
        }

        let cache_key = key.to_string();
        log::debug!("Caching {} for {}...", &cache_key, format_duration(ttl));

        let valid_until = Instant::now().checked_add(ttl).ok_or_else(|| {
            anyhow::anyhow!(
                "Cannot cache {}: The TTL of {} is out of range.",
                &cache_key,
                format_duration(ttl)
            )
        })?;
        let entry = CacheEntry { value, valid_until };

        Ok(self.store.set(&cache_key, entry).await?.value)
    }

    /// Determines if an entry is stored for the given key.
    ///
    /// Note that this doesn't check if the entry is still valid.
    pub async fn has(&self, key: &CacheKey) -> anyhow::Result<bool> {
        self.store.has(&key.to_string()).await
    }

    /// Removes the entry for the given key.
    pub async fn delete(&self, key: &CacheKey) -> anyhow::Result<()> {
        self.store.delete(&key.to_string()).await
    }

    /// Removes all entries from the underlying store.
    ///
    /// Note that this also affects entries which weren't stored by this policy.
    pub async fn clear(&self) -> anyhow::Result<()> {
        self.store.clear().await
    }
}

/// Removes the last path segment of the given URL.
fn drop_last_segment(url: &str) -> &str {
    url.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use crate::cache::mem::MemCache;
    use crate::cache::policy::{drop_last_segment, CacheKey, CachePolicy};
    use crate::cache::rules::{CachePolicyConfig, ResourcePolicy};
    use crate::cache::{CacheEntry, KeyValueCache};
    use crate::request::Method;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const BASE_URL: &str = "https://example.com";

    fn url(path: &str) -> String {
        format!("{}{}", BASE_URL, path)
    }

    fn policy(config: CachePolicyConfig) -> (CachePolicy, Arc<MemCache<CacheEntry>>) {
        let store: Arc<MemCache<CacheEntry>> = Arc::new(MemCache::new());
        (CachePolicy::new(config, store.clone()).unwrap(), store)
    }

    #[test]
    fn entries_expire_after_their_ttl() {
        crate::testing::test_async(async {
            let (policy, store) = policy(CachePolicyConfig::new().with_ttl(Duration::from_secs(10)));
            let key = CacheKey::get(url("/fish"));

            assert_eq!(policy.set(&key, json!("r")).await.unwrap(), json!("r"));
            assert_eq!(policy.get(&key).await.unwrap(), Some(json!("r")));

            tokio::time::sleep(Duration::from_secs(9)).await;
            assert_eq!(policy.get(&key).await.unwrap(), Some(json!("r")));

            // Expiry is inclusive: at exactly "valid_until" the entry is gone...
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(policy.has(&key).await.unwrap(), true);
            assert_eq!(policy.get(&key).await.unwrap(), None);

            // ..and the expired entry has been purged from the store.
            assert_eq!(policy.has(&key).await.unwrap(), false);
            assert_eq!(store.is_empty(), true);
        });
    }

    #[test]
    fn resource_ttls_override_the_default() {
        crate::testing::test_async(async {
            let (policy, _) = policy(
                CachePolicyConfig::new()
                    .with_ttl(Duration::from_secs(1))
                    .resource(BASE_URL, "/fish", ResourcePolicy::with_ttl(Duration::from_secs(100))),
            );
            let fish = CacheKey::get(url("/fish"));
            let shark = CacheKey::get(url("/shark"));

            let _ = policy.set(&fish, json!("Wanda")).await.unwrap();
            let _ = policy.set(&shark, json!("Bruce")).await.unwrap();

            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(policy.get(&fish).await.unwrap(), Some(json!("Wanda")));
            assert_eq!(policy.get(&shark).await.unwrap(), None);

            tokio::time::sleep(Duration::from_secs(100)).await;
            assert_eq!(policy.get(&fish).await.unwrap(), None);
        });
    }

    #[test]
    fn the_first_matching_base_url_wins() {
        let (policy, _) = policy(
            CachePolicyConfig::new()
                .resource(BASE_URL, "/a", ResourcePolicy::with_ttl(Duration::from_secs(5)))
                .resource(
                    format!("{}/a", BASE_URL),
                    "",
                    ResourcePolicy::with_ttl(Duration::from_secs(7)),
                ),
        );

        assert_eq!(policy.ttl_for(&url("/a")), Duration::from_secs(5));
        assert_eq!(
            policy.ttl_for(&url("/b")),
            crate::cache::rules::DEFAULT_TTL
        );
    }

    #[test]
    fn a_zero_ttl_disables_caching() {
        crate::testing::test_async(async {
            let (policy, store) = policy(CachePolicyConfig::new().resource(
                BASE_URL,
                "/live",
                ResourcePolicy::with_ttl(Duration::ZERO),
            ));
            let key = CacheKey::get(url("/live"));

            assert_eq!(policy.set(&key, json!(42)).await.unwrap(), json!(42));
            assert_eq!(policy.get(&key).await.unwrap(), None);
            assert_eq!(store.is_empty(), true);
        });
    }

    #[test]
    fn out_of_range_ttls_are_reported() {
        crate::testing::test_async(async {
            let (policy, store) =
                policy(CachePolicyConfig::new().with_ttl(Duration::from_secs(u64::MAX / 2)));
            let key = CacheKey::get(url("/fish"));

            assert_eq!(policy.set(&key, json!("Wanda")).await.is_err(), true);
            assert_eq!(store.is_empty(), true);
        });
    }

    #[test]
    fn only_get_is_cached() {
        crate::testing::test_async(async {
            let (policy, store) = policy(CachePolicyConfig::new());

            for method in [
                Method::Post,
                Method::Put,
                Method::Patch,
                Method::Delete,
                Method::Head,
            ] {
                let key = CacheKey::new(method, url("/fish"));
                assert_eq!(policy.set(&key, json!("r")).await.unwrap(), json!("r"));
                assert_eq!(policy.get(&key).await.unwrap(), None);
            }

            assert_eq!(store.is_empty(), true);
        });
    }

    #[test]
    fn writes_invalidate_the_resource_and_its_parent() {
        crate::testing::test_async(async {
            for method in [Method::Put, Method::Patch] {
                let (policy, _) = policy(CachePolicyConfig::new());
                let fish = CacheKey::get(url("/fish/1"));
                let all_fish = CacheKey::get(url("/fish"));
                let sharks = CacheKey::get(url("/sharks"));

                for key in [&fish, &all_fish, &sharks] {
                    let _ = policy.set(key, json!("r")).await.unwrap();
                }

                assert_eq!(
                    policy
                        .get(&CacheKey::new(method, url("/fish/1")))
                        .await
                        .unwrap(),
                    None
                );

                assert_eq!(policy.get(&fish).await.unwrap(), None);
                assert_eq!(policy.get(&all_fish).await.unwrap(), None);
                assert_eq!(policy.get(&sharks).await.unwrap(), Some(json!("r")));
            }
        });
    }

    #[test]
    fn posts_invalidate_declared_containers() {
        crate::testing::test_async(async {
            let (policy, _) = policy(CachePolicyConfig::new().resource(
                BASE_URL,
                "/list-fish",
                ResourcePolicy::default().contains("/fish").contains("/fish/*"),
            ));
            let list = CacheKey::get(url("/list-fish"));

            let _ = policy.set(&list, json!(["Wanda"])).await.unwrap();
            let _ = policy
                .get(&CacheKey::new(Method::Post, url("/fish")))
                .await
                .unwrap();
            assert_eq!(policy.get(&list).await.unwrap(), None);

            let _ = policy.set(&list, json!(["Wanda"])).await.unwrap();
            let _ = policy
                .get(&CacheKey::new(Method::Put, url("/fish/wanda")))
                .await
                .unwrap();
            assert_eq!(policy.get(&list).await.unwrap(), None);

            // Unrelated writes and plain reads leave the container alone...
            let _ = policy.set(&list, json!(["Wanda"])).await.unwrap();
            let _ = policy
                .get(&CacheKey::new(Method::Post, url("/sharks/bruce")))
                .await
                .unwrap();
            let _ = policy
                .get(&CacheKey::new(Method::Delete, url("/fish/wanda")))
                .await
                .unwrap();
            let _ = policy.get(&CacheKey::get(url("/fish/wanda"))).await.unwrap();
            assert_eq!(policy.get(&list).await.unwrap(), Some(json!(["Wanda"])));
        });
    }

    #[test]
    fn clear_removes_everything() {
        crate::testing::test_async(async {
            let (policy, store) = policy(CachePolicyConfig::new());
            let _ = store
                .set(
                    "foreign",
                    CacheEntry {
                        value: json!(1),
                        valid_until: tokio::time::Instant::now(),
                    },
                )
                .await
                .unwrap();

            let keys = [CacheKey::get(url("/a")), CacheKey::get(url("/b"))];
            for key in &keys {
                let _ = policy.set(key, json!("r")).await.unwrap();
            }

            policy.clear().await.unwrap();

            for key in &keys {
                assert_eq!(policy.get(key).await.unwrap(), None);
            }
            assert_eq!(store.is_empty(), true);
        });
    }

    #[test]
    fn delete_uses_the_composite_key() {
        crate::testing::test_async(async {
            let (policy, store) = policy(CachePolicyConfig::new());
            let key = CacheKey::get(url("/fish"));
            let _ = policy.set(&key, json!("r")).await.unwrap();

            assert_eq!(store.has("GET:https://example.com/fish").await.unwrap(), true);
            policy.delete(&key).await.unwrap();
            assert_eq!(policy.has(&key).await.unwrap(), false);
        });
    }

    #[test]
    fn invalidation_targets_are_unique() {
        let (policy, _) = policy(CachePolicyConfig::new().resource(
            BASE_URL,
            "/fish",
            ResourcePolicy::default().contains("/fish/*"),
        ));

        assert_eq!(
            policy.invalidation_targets(&url("/fish/1")),
            vec![url("/fish/1"), url("/fish")]
        );
        assert_eq!(drop_last_segment("fish"), "");
        assert_eq!(drop_last_segment("https://example.com/fish/"), url("/fish"));
    }
}
