//! Performs requests via HTTP(S) using **hyper**.
use anyhow::Context;
use async_trait::async_trait;
use courier::request::{RequestOptions, Transport};
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Request};
use hyper_tls::HttpsConnector;
use serde_json::Value;

/// Sends each request to the network. Thanks to the connection pool of the client, connections
/// are reused whenever possible.
///
/// JSON responses are parsed, everything else is delivered as string.
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HyperTransport {
    /// Creates a transport which supports both HTTP and HTTPS.
    pub fn new() -> Self {
        HyperTransport {
            client: Client::builder().build::<_, Body>(HttpsConnector::new()),
        }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn perform(&self, url: &str, options: &RequestOptions) -> anyhow::Result<Value> {
        let method = options.method();

        let mut request = Request::builder().method(method.as_str()).uri(url);
        if let Some(headers) = &options.headers {
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }
        }

        let body = match &options.body {
            None => Body::empty(),
            Some(Value::String(text)) => Body::from(text.clone()),
            Some(body) => {
                request = request.header(CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(body).context("Failed to encode the body.")?)
            }
        };
        let request = request.body(body).context("Failed to build request.")?;

        let response = self
            .client
            .request(request)
            .await
            .with_context(|| format!("Failed to perform {} {}", method, url))?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("json"))
            .unwrap_or(false);
        let data = hyper::body::to_bytes(response.into_body())
            .await
            .context("Failed to read the response body.")?;

        if !status.is_success() {
            return Err(anyhow::anyhow!("{} {} failed: {}", method, url, status));
        }

        if is_json && !data.is_empty() {
            serde_json::from_slice(&data).context("Failed to parse the response as JSON.")
        } else {
            Ok(Value::String(String::from_utf8_lossy(&data).into_owned()))
        }
    }
}
