//! Describes the requests which are ferried through the system.
//!
//! A request is a URL along with its [RequestOptions](RequestOptions). Options are serialized
//! as part of a **REQUEST** envelope, therefore everything in here is (de)serializable via serde
//! using the camelCase names which are used on the wire.
//!
//! The actual network call is performed by a [Transport](Transport). This is an external
//! collaborator: the queue only knows how to invoke it and how to drop its future once the
//! request is cancelled.
//!
//! # Examples
//!
//! Decoding options as sent by a caller:
//! ```
//! # use courier::request::{Method, RequestOptions};
//! let options: RequestOptions = serde_json::from_str(r#"{
//!     "method": "POST",
//!     "body": { "name": "Wanda" },
//!     "cacheResponse": false
//! }"#).unwrap();
//!
//! assert_eq!(options.method(), Method::Post);
//! assert_eq!(options.is_cancelable(), true);
//! assert_eq!(options.should_cache_response(), false);
//! ```
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Enumerates the HTTP methods known to the cache policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Reads a resource. The only method which is ever cached or deduplicated.
    Get,
    /// Like GET but without a body.
    Head,
    /// Creates a resource, invalidates its container.
    Post,
    /// Replaces a resource, invalidates the resource and its container.
    Put,
    /// Modifies a resource, invalidates the resource and its container.
    Patch,
    /// Removes a resource.
    Delete,
    /// Queries the supported methods.
    Options,
    /// Opens a tunnel.
    Connect,
    /// Performs a loop-back test.
    Trace,
}

impl Method {
    /// Returns the canonical (upper case) name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
        }
    }

    /// Determines if this method modifies a resource in a way which invalidates cached reads.
    pub fn is_write(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl Default for Method {
    fn default() -> Self {
        Method::Get
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            "CONNECT" => Ok(Method::Connect),
            "TRACE" => Ok(Method::Trace),
            _ => Err(anyhow::anyhow!("Unknown HTTP method: {}", value)),
        }
    }
}

/// Contains the options of a single request.
///
/// All fields are optional so that a caller only has to specify what deviates from a plain
/// GET request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    /// The HTTP method to use, **GET** if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,

    /// The body to send along.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    /// Additional headers to send along.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    /// Determines if dropping the response on the caller side cancels the request in the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelable: Option<bool>,

    /// Skips the cache lookup and always performs the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_remote: Option<bool>,

    /// Set to **false** to not store the response in the cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_response: Option<bool>,
}

impl RequestOptions {
    /// Creates the options for a request using the given method.
    pub fn with_method(method: Method) -> Self {
        RequestOptions {
            method: Some(method),
            ..Default::default()
        }
    }

    /// Adds a body to the request.
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds a header to the request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self
            .headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// Explicitly marks the request as (non) cancelable.
    pub fn cancelable(mut self, cancelable: bool) -> Self {
        self.cancelable = Some(cancelable);
        self
    }

    /// Forces the request to bypass any cached response.
    pub fn from_remote(mut self) -> Self {
        self.from_remote = Some(true);
        self
    }

    /// Prevents the response from being cached.
    pub fn skip_cache(mut self) -> Self {
        self.cache_response = Some(false);
        self
    }

    /// Returns the effective method.
    pub fn method(&self) -> Method {
        self.method.unwrap_or_default()
    }

    /// Determines if the request can be cancelled by the caller.
    ///
    /// Unless specified otherwise, reads are not cancelable (they're shared between callers and
    /// their result is cached anyway), but all other methods are.
    pub fn is_cancelable(&self) -> bool {
        self.cancelable.unwrap_or(self.method() != Method::Get)
    }

    /// Determines if the cache has to be consulted before performing the request.
    pub fn should_use_cache(&self) -> bool {
        !self.from_remote.unwrap_or(false)
    }

    /// Determines if the response is to be stored in the cache.
    pub fn should_cache_response(&self) -> bool {
        self.cache_response.unwrap_or(true)
    }

    /// Fills in all defaults so that the options can be handed to a transport as is.
    pub fn normalize(mut self) -> Self {
        self.method = Some(self.method());
        self
    }
}

/// Performs the actual network call for a request.
///
/// A transport is expected to deliver exactly one value or an error. Cancelling a request is done
/// by dropping the future returned by **perform**, therefore an implementation should release
/// its resources in its drop handlers.
///
/// # Example
///
/// ```
/// # use courier::request::{RequestOptions, Transport};
/// # use serde_json::Value;
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl Transport for Echo {
///     async fn perform(&self, url: &str, options: &RequestOptions) -> anyhow::Result<Value> {
///         Ok(Value::String(format!("{} {}", options.method(), url)))
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Performs the request for the given URL.
    async fn perform(&self, url: &str, options: &RequestOptions) -> anyhow::Result<Value>;
}

/// Wraps a closure as [Transport](Transport).
///
/// # Example
///
/// ```
/// # use courier::request::transport_fn;
/// let transport = transport_fn(|url, _options| async move {
///     Ok(serde_json::json!({ "url": url }))
/// });
/// ```
pub fn transport_fn<F, Fut>(perform: F) -> FnTransport<F>
where
    F: Fn(String, RequestOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnTransport { perform }
}

/// A [Transport](Transport) backed by a closure, created via [transport_fn](transport_fn).
pub struct FnTransport<F> {
    perform: F,
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(String, RequestOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn perform(&self, url: &str, options: &RequestOptions) -> anyhow::Result<Value> {
        (self.perform)(url.to_owned(), options.clone()).await
    }
}
