//! Transport seam between the dispatch client and the upstream
//!
//! A [`Transport`] opens one [`Session`] per leased identity; the session
//! carries that identity's credential and egress proxy. [`HttpTransport`] is
//! the `reqwest` implementation.
//!
//! Credential mapping for [`HttpTransport`]:
//! - `header.<Name>` entries become request headers
//! - every other entry becomes a cookie

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use lease_store::Identity;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Credential key prefix for entries sent as headers.
pub const HEADER_PREFIX: &str = "header.";

/// Failure below the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),

    /// The request itself is malformed and was never sent.
    #[error("invalid request: {0}")]
    Request(String),
}

impl TransportError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_builder() {
            TransportError::Request(e.to_string())
        } else if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connect",
            TransportError::Other(_) => "other",
            TransportError::Request(_) => "request",
        }
    }

    /// Whether sending again, on this identity or another, could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Request(_))
    }
}

/// One logical upstream call.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl UpstreamRequest {
    pub fn new(method: reqwest::Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(reqwest::Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(reqwest::Method::POST, url)
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Upstream reply, body fully read. Header names are lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    json: Option<serde_json::Value>,
}

impl UpstreamResponse {
    pub fn new(status: u16, headers: BTreeMap<String, String>, body: impl Into<String>) -> Self {
        let body = body.into();
        let json = serde_json::from_str(&body).ok();
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        Self {
            status,
            headers,
            body,
            json,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn header_i64(&self, name: &str) -> Option<i64> {
        self.header(name).and_then(|v| v.trim().parse().ok())
    }

    /// Parsed JSON body, if the body is JSON.
    pub fn json(&self) -> Option<&serde_json::Value> {
        self.json.as_ref()
    }

    /// `(code, message)` pairs from a top-level `errors` array.
    pub fn errors(&self) -> Vec<(i64, String)> {
        let Some(errors) = self
            .json
            .as_ref()
            .and_then(|json| json.get("errors"))
            .and_then(|errors| errors.as_array())
        else {
            return Vec::new();
        };
        errors
            .iter()
            .map(|error| {
                let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default()
                    .to_string();
                (code, message)
            })
            .collect()
    }

    pub fn has_error_code(&self, code: i64) -> bool {
        self.errors().iter().any(|(c, _)| *c == code)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors().is_empty()
    }

    /// `(code) message` entries joined with `; `.
    pub fn error_summary(&self) -> Option<String> {
        let errors = self.errors();
        if errors.is_empty() {
            return None;
        }
        let mut parts: Vec<String> = errors
            .iter()
            .map(|(code, message)| format!("({code}) {message}"))
            .collect();
        parts.dedup();
        Some(parts.join("; "))
    }
}

pub type SendFuture<'a> =
    Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>>;

/// Connection state bound to one identity.
pub trait Session: Send + Sync {
    fn send<'a>(&'a mut self, request: &'a UpstreamRequest) -> SendFuture<'a>;
}

/// Opens sessions for leased identities.
///
/// Uses `Pin<Box<dyn Future>>` in [`Session`] for dyn-compatibility
/// (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn open(&self, identity: &Identity) -> Result<Box<dyn Session>, TransportError>;
}

/// Caps concurrently open sessions across every client sharing it.
#[derive(Debug, Clone)]
pub struct SessionLimiter {
    slots: Arc<Semaphore>,
    max: usize,
}

impl SessionLimiter {
    pub fn new(max_sessions: usize) -> Self {
        let max = max_sessions.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Wait for a free session slot. `None` once the limiter is closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).acquire_owned().await.ok()
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.max - self.available()
    }

    pub fn close(&self) {
        self.slots.close();
    }
}

/// `reqwest` transport: one client per identity with its credential as
/// default headers and its proxy, if any.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn default_headers(identity: &Identity) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        let mut cookies = Vec::new();
        for (key, value) in identity.credential.iter() {
            match key.strip_prefix(HEADER_PREFIX) {
                Some(name) => {
                    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                        TransportError::Other(format!("invalid header name {name:?}: {e}"))
                    })?;
                    let mut value = HeaderValue::from_str(value).map_err(|e| {
                        TransportError::Other(format!("invalid value for header {name}: {e}"))
                    })?;
                    value.set_sensitive(true);
                    headers.insert(name, value);
                }
                None => cookies.push(format!("{key}={value}")),
            }
        }
        if !cookies.is_empty() {
            let mut value = HeaderValue::from_str(&cookies.join("; "))
                .map_err(|e| TransportError::Other(format!("invalid cookie value: {e}")))?;
            value.set_sensitive(true);
            headers.insert(COOKIE, value);
        }
        Ok(headers)
    }
}

impl Transport for HttpTransport {
    fn open(&self, identity: &Identity) -> Result<Box<dyn Session>, TransportError> {
        let mut builder = reqwest::Client::builder()
            .default_headers(Self::default_headers(identity)?)
            .timeout(self.timeout);
        if let Some(proxy) = &identity.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| TransportError::Other(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Other(format!("building client: {e}")))?;
        debug!(identity = %identity.handle, proxied = identity.proxy.is_some(), "session opened");
        Ok(Box::new(HttpSession { client }))
    }
}

struct HttpSession {
    client: reqwest::Client,
}

impl HttpSession {
    async fn perform(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        let url = if request.query.is_empty() {
            reqwest::Url::parse(&request.url)
        } else {
            reqwest::Url::parse_with_params(&request.url, &request.query)
        }
        .map_err(|e| TransportError::Request(format!("invalid url {}: {e}", request.url)))?;

        let mut builder = self.client.request(request.method.clone(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(TransportError::from_reqwest)?;
        Ok(UpstreamResponse::new(status, headers, body))
    }
}

impl Session for HttpSession {
    fn send<'a>(&'a mut self, request: &'a UpstreamRequest) -> SendFuture<'a> {
        Box::pin(self.perform(request))
    }
}
