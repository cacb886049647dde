//! Describes the rules enforced by a [CachePolicy](crate::cache::policy::CachePolicy).
//!
//! A policy consists of a default TTL and a set of resources. Resources are grouped by their
//! base URL and addressed by their exact path. Each resource can override the TTL and declare
//! which other resources it **contains**. Once any of these is modified, the cached container is
//! invalidated as well.
//!
//! # Configuration
//!
//! ```yaml
//! cache:
//!     # Default TTL. A plain number is interpreted as seconds.
//!     ttl: 210
//!     resources:
//!         "https://example.com":
//!             "/list-fish":
//!                 ttl: 10m
//!                 # Writing to "/fish" or "/fish/<anything>" invalidates "/list-fish".
//!                 # "*" matches within a single path segment, "**" across segments.
//!                 contains: ["/fish", "/fish/*"]
//! ```
//!
//! # Examples
//!
//! ```
//! # use courier::cache::rules::CachePolicyConfig;
//! # use std::time::Duration;
//! let docs = yaml_rust::YamlLoader::load_from_str("
//! ttl: 30s
//! resources:
//!     'https://example.com':
//!         '/list-fish':
//!             ttl: 600
//!             contains: '/fish/*'
//! ").unwrap();
//!
//! let config = CachePolicyConfig::from_yaml(&docs[0]).unwrap();
//! assert_eq!(config.ttl, Some(Duration::from_secs(30)));
//!
//! let resource = &config.resources["https://example.com"]["/list-fish"];
//! assert_eq!(resource.ttl, Some(Duration::from_secs(600)));
//! assert_eq!(resource.contains, vec!["/fish/*".to_owned()]);
//! ```
use std::time::Duration;

use linked_hash_map::LinkedHashMap;
use regex::Regex;
use yaml_rust::Yaml;

use crate::fmt::{format_duration, parse_duration};

/// The TTL used if neither the resource nor the policy specifies one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(210);

/// Contains the largest TTL accepted in the config (one year).
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Describes the caching behaviour of a single resource.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourcePolicy {
    /// Overrides the default TTL for this resource. A TTL of zero disables caching.
    pub ttl: Option<Duration>,

    /// Lists the path patterns of all resources contained in this one.
    pub contains: Vec<String>,
}

impl ResourcePolicy {
    /// Creates a policy which overrides the TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        ResourcePolicy {
            ttl: Some(ttl),
            contains: Vec::new(),
        }
    }

    /// Declares that resources matching the given pattern are contained in this resource.
    pub fn contains(mut self, pattern: impl Into<String>) -> Self {
        self.contains.push(pattern.into());
        self
    }

    fn from_yaml(yaml: &Yaml, location: &str) -> anyhow::Result<Self> {
        let contains = match &yaml["contains"] {
            Yaml::BadValue | Yaml::Null => Vec::new(),
            Yaml::String(pattern) => vec![pattern.clone()],
            Yaml::Array(patterns) => patterns
                .iter()
                .map(|pattern| {
                    pattern.as_str().map(str::to_owned).ok_or_else(|| {
                        anyhow::anyhow!(
                            "Invalid 'contains' pattern for {}: Expected a string.",
                            location
                        )
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid 'contains' for {}: Expected a string or a list of strings.",
                    location
                ))
            }
        };

        Ok(ResourcePolicy {
            ttl: parse_ttl(&yaml["ttl"], location)?,
            contains,
        })
    }
}

/// Describes a complete cache policy.
///
/// Resources are kept in declaration order, as the first base URL which prefixes a given URL
/// determines the rules to apply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CachePolicyConfig {
    /// The default TTL of all resources. Falls back to [DEFAULT_TTL](DEFAULT_TTL).
    pub ttl: Option<Duration>,

    /// Maps base URLs to the policies of their exact paths.
    pub resources: LinkedHashMap<String, LinkedHashMap<String, ResourcePolicy>>,
}

impl CachePolicyConfig {
    /// Creates an empty policy which caches every GET for [DEFAULT_TTL](DEFAULT_TTL).
    pub fn new() -> Self {
        CachePolicyConfig::default()
    }

    /// Specifies the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Adds the policy for the given resource.
    ///
    /// # Examples
    ///
    /// ```
    /// # use courier::cache::rules::{CachePolicyConfig, ResourcePolicy};
    /// # use std::time::Duration;
    /// let config = CachePolicyConfig::new()
    ///     .with_ttl(Duration::from_secs(1))
    ///     .resource("https://example.com", "/fish", ResourcePolicy::with_ttl(Duration::from_secs(100)));
    ///
    /// assert_eq!(config.resources["https://example.com"].len(), 1);
    /// ```
    pub fn resource(
        mut self,
        base_url: impl Into<String>,
        path: impl Into<String>,
        policy: ResourcePolicy,
    ) -> Self {
        let _ = self
            .resources
            .entry(base_url.into())
            .or_insert_with(LinkedHashMap::new)
            .insert(path.into(), policy);
        self
    }

    /// Reads the policy from the given YAML object (the **cache** section of the config).
    ///
    /// A missing section yields the default policy.
    pub fn from_yaml(yaml: &Yaml) -> anyhow::Result<Self> {
        let mut config = CachePolicyConfig {
            ttl: parse_ttl(&yaml["ttl"], "the cache")?,
            resources: LinkedHashMap::new(),
        };

        let resources = match &yaml["resources"] {
            Yaml::BadValue | Yaml::Null => return Ok(config),
            Yaml::Hash(resources) => resources,
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid cache resources: Expected an object of base URLs."
                ))
            }
        };

        for (base_url, paths) in resources {
            let base_url = base_url
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("Invalid cache resources: A base URL was expected."))?;
            let paths = paths.as_hash().ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid resources for {}: Expected an object of paths.",
                    base_url
                )
            })?;

            let mut resource_policies = LinkedHashMap::new();
            for (path, policy) in paths {
                let path = path.as_str().ok_or_else(|| {
                    anyhow::anyhow!("Invalid resources for {}: A path was expected.", base_url)
                })?;
                let location = format!("{}{}", base_url, path);
                let _ = resource_policies
                    .insert(path.to_owned(), ResourcePolicy::from_yaml(policy, &location)?);
            }

            let _ = config
                .resources
                .insert(base_url.to_owned(), resource_policies);
        }

        Ok(config)
    }
}

fn parse_ttl(yaml: &Yaml, location: &str) -> anyhow::Result<Option<Duration>> {
    let ttl = match yaml {
        Yaml::BadValue | Yaml::Null => return Ok(None),
        Yaml::Integer(seconds) if *seconds >= 0 => Duration::from_secs(*seconds as u64),
        Yaml::String(duration) => parse_duration(duration)
            .map_err(|error| anyhow::anyhow!("Invalid TTL for {}: {}", location, error))?,
        _ => {
            return Err(anyhow::anyhow!(
                "Invalid TTL for {}: Expected a positive number of seconds or a duration like '10m'.",
                location
            ))
        }
    };

    if ttl > MAX_TTL {
        return Err(anyhow::anyhow!(
            "Invalid TTL for {}: {} exceeds the maximum of {}.",
            location,
            format_duration(ttl),
            format_duration(MAX_TTL)
        ));
    }

    Ok(Some(ttl))
}

/// Compiles a **contains** pattern into a regex matching complete URLs.
///
/// The resulting expression is anchored on both ends. Within the pattern, only glob wildcards
/// are interpreted: **\*** matches anything but a slash, **\*\*** matches anything. All other
/// characters (of the pattern as well as of the base URL) are taken literally.
///
/// # Examples
///
/// ```
/// # use courier::cache::rules::compile_pattern;
/// let fish = compile_pattern("https://example.com", "/fish/*").unwrap();
/// assert_eq!(fish.is_match("https://example.com/fish/42"), true);
/// assert_eq!(fish.is_match("https://example.com/fish/42/fins"), false);
/// assert_eq!(fish.is_match("https://example.com/fish"), false);
///
/// let ocean = compile_pattern("https://example.com", "/ocean/**").unwrap();
/// assert_eq!(ocean.is_match("https://example.com/ocean/atlantic/fish"), true);
///
/// // Dots and other regex meta characters are literals...
/// let exact = compile_pattern("https://example.com", "/fish.json").unwrap();
/// assert_eq!(exact.is_match("https://example.com/fish.json"), true);
/// assert_eq!(exact.is_match("https://example.com/fishxjson"), false);
/// ```
pub fn compile_pattern(base_url: &str, pattern: &str) -> anyhow::Result<Regex> {
    let mut expression = String::with_capacity(base_url.len() + pattern.len() + 8);
    expression.push('^');
    expression.push_str(&regex::escape(base_url));

    let mut literal = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '*' {
            literal.push(ch);
            continue;
        }

        expression.push_str(&regex::escape(&literal));
        literal.clear();

        if chars.peek() == Some(&'*') {
            let _ = chars.next();
            expression.push_str(".*");
        } else {
            expression.push_str("[^/]*");
        }
    }
    expression.push_str(&regex::escape(&literal));
    expression.push('$');

    Regex::new(&expression).map_err(|error| {
        anyhow::anyhow!(
            "Cannot compile the pattern '{}' for {}: {}",
            pattern,
            base_url,
            error
        )
    })
}

#[cfg(test)]
mod tests {
    use crate::cache::rules::{compile_pattern, CachePolicyConfig, ResourcePolicy, MAX_TTL};
    use std::time::Duration;
    use yaml_rust::{Yaml, YamlLoader};

    fn parse(data: &str) -> anyhow::Result<CachePolicyConfig> {
        let docs = YamlLoader::load_from_str(data).unwrap();
        CachePolicyConfig::from_yaml(&docs[0])
    }

    #[test]
    fn missing_sections_yield_defaults() {
        assert_eq!(
            CachePolicyConfig::from_yaml(&Yaml::BadValue).unwrap(),
            CachePolicyConfig::new()
        );
        assert_eq!(parse("other: 1").unwrap(), CachePolicyConfig::new());
    }

    #[test]
    fn resources_keep_their_declaration_order() {
        let config = parse(
            "
ttl: 1
resources:
    'https://b.example.com':
        '/fish':
            ttl: 100
    'https://a.example.com':
        '/list-fish':
            contains: ['/fish', '/fish/*']
        '/sharks':
            ttl: 0
",
        )
        .unwrap();

        assert_eq!(config.ttl, Some(Duration::from_secs(1)));
        assert_eq!(
            config.resources.keys().collect::<Vec<_>>(),
            vec!["https://b.example.com", "https://a.example.com"]
        );
        assert_eq!(
            config.resources["https://a.example.com"]["/list-fish"],
            ResourcePolicy::default().contains("/fish").contains("/fish/*")
        );
        assert_eq!(
            config.resources["https://a.example.com"]["/sharks"].ttl,
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn invalid_ttls_are_reported() {
        assert_eq!(parse("ttl: -5").is_err(), true);
        assert_eq!(parse("ttl: soon").is_err(), true);
        assert_eq!(parse("ttl: 9223372036854775807").is_err(), true);
        assert_eq!(parse("ttl: 999999999999999999d").is_err(), true);
        assert_eq!(parse("ttl: 400d").is_err(), true);
        assert_eq!(parse("ttl: 365d").unwrap().ttl, Some(MAX_TTL));
        assert_eq!(
            parse("resources:\n  'https://x.com':\n    '/a':\n      ttl: [1]").is_err(),
            true
        );
        assert_eq!(
            parse("resources:\n  'https://x.com':\n    '/a':\n      contains: 5").is_err(),
            true
        );
    }

    #[test]
    fn single_stars_stay_within_a_segment() {
        let pattern = compile_pattern("http://x.com", "/a/*/c").unwrap();
        assert_eq!(pattern.is_match("http://x.com/a/b/c"), true);
        assert_eq!(pattern.is_match("http://x.com/a//c"), true);
        assert_eq!(pattern.is_match("http://x.com/a/b/b/c"), false);

        let pattern = compile_pattern("http://x.com", "/a/**/c").unwrap();
        assert_eq!(pattern.is_match("http://x.com/a/b/b/c"), true);

        // The base URL is part of the match...
        assert_eq!(pattern.is_match("http://y.com/a/b/c"), false);
        assert_eq!(pattern.is_match("http://x.com/a/b/c?page=2"), false);
    }
}
