//! Plain HTTP request/response values and the transport seam.
//!
//! Requests are built by ordinary factory functions in the modules that own
//! each wire exchange and handed to a [`Transport`]. [`ReqwestTransport`] is the
//! production implementation; [`MockTransport`] records requests and replays
//! scripted responses for tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::cookie::Jar;
use tracing::trace;

use crate::config::{DownloadConfig, HttpSettings};
use crate::error::{TransferError, TransferResult};

/// HTTP methods used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// PUT
    Put,
    /// POST
    Post,
}

/// A fully built outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    /// Header name/value pairs in insertion order.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<Bytes>,
    /// Per-request timeout, if any.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Create a request with no headers and no body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// PUT request.
    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    /// POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Append query parameters, percent-encoding each value.
    pub fn query(mut self, params: &[(&str, &str)]) -> Self {
        for (key, value) in params {
            let sep = if self.url.contains('?') { '&' } else { '?' };
            self.url.push(sep);
            self.url.push_str(&urlencoding::encode(key));
            self.url.push('=');
            self.url.push_str(&urlencoding::encode(value));
        }
        self
    }

    /// Add a header.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Set a raw body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Set an `application/x-www-form-urlencoded` body.
    pub fn form(self, fields: &[(&str, &str)]) -> Self {
        let encoded = fields
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        self.header("Content-Type", "application/x-www-form-urlencoded")
            .body(Bytes::from(encoded))
    }

    /// Set the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Look up a header value (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Look up a decoded query parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let url = reqwest::Url::parse(&self.url).ok()?;
        let found = url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned());
        found
    }

    /// Length of the body in bytes.
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map(|b| b.len()).unwrap_or(0)
    }
}

/// A failed exchange at the transport level (no HTTP status available).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    /// Description of the failure.
    pub message: String,
    /// True if the failure was a timeout.
    pub timed_out: bool,
}

impl TransportError {
    /// A non-timeout failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    /// A timeout failure.
    pub fn timeout(what: &str) -> Self {
        Self {
            message: format!("{} timed out", what),
            timed_out: true,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }
    }
}

/// Streaming response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// A response whose headers have arrived; the body is read lazily.
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: BodyStream,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Response with an in-memory body.
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers: Vec::new(),
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    /// Response with a JSON body.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::from_bytes(status, value.to_string())
            .with_header("Content-Type", "application/json")
    }

    /// Response whose body is delivered in the given pieces.
    pub fn from_chunks(status: u16, chunks: Vec<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// True for 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Look up a header value (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Collect the whole body.
    pub async fn bytes(mut self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// Sends requests. Implementations must be safe to share across transfers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and return once response headers are available.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// reqwest-backed transport with a pooled, cookie-aware client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client for one credential identity.
    ///
    /// Idle connections are kept indefinitely and never closed by the pipeline.
    pub fn new(
        settings: &HttpSettings,
        download: &DownloadConfig,
        cookies: Arc<Jar>,
    ) -> TransferResult<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .cookie_provider(cookies)
            .connect_timeout(Duration::from_secs(download.connect_timeout_secs))
            .pool_idle_timeout(None);
        if let Some(proxy) = &settings.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| TransferError::Config(format!("invalid proxy {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| TransferError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
        };
        trace!(method = ?request.method, url = %redact(&request.url), "sending request");

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Strip secrets from a URL before it reaches a log line.
pub(crate) fn redact(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| {
                    let v = if k == "access_token" || k == "token" {
                        "[REDACTED]".to_string()
                    } else {
                        v.into_owned()
                    };
                    (k.into_owned(), v)
                })
                .collect();
            if pairs.is_empty() {
                return parsed.to_string();
            }
            parsed.query_pairs_mut().clear().extend_pairs(pairs);
            parsed.to_string()
        }
        Err(_) => "[unparseable url]".to_string(),
    }
}

type Responder = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// In-memory transport for tests: records every request and answers through a responder.
pub struct MockTransport {
    requests: Mutex<Vec<HttpRequest>>,
    responder: Box<Responder>,
}

impl MockTransport {
    /// Create a mock answering every request through `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// Snapshot of all requests seen so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of requests whose URL contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.requests().iter().filter(|r| r.url.contains(needle)).count()
    }

    /// Total number of requests seen.
    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("requests", &self.request_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = (self.responder)(&request);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_encoding() {
        let req = HttpRequest::get("https://api.example/file").query(&[
            ("home", "/My Docs/a&b.txt"),
            ("client_id", "cloud-win"),
        ]);
        assert!(req.url.starts_with("https://api.example/file?home=%2FMy%20Docs%2Fa%26b.txt&"));
        assert_eq!(req.query_param("home").as_deref(), Some("/My Docs/a&b.txt"));
        assert_eq!(req.query_param("client_id").as_deref(), Some("cloud-win"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn test_query_appends_to_existing() {
        let req = HttpRequest::get("https://shard.example/upload?x=1").query(&[("y", "2")]);
        assert_eq!(req.url, "https://shard.example/upload?x=1&y=2");
    }

    #[test]
    fn test_form_body() {
        let req = HttpRequest::post("https://api.example/file/add")
            .form(&[("home", "/a b"), ("size", "10")]);
        assert_eq!(
            req.header_value("content-type"),
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(req.body.unwrap(), Bytes::from("home=%2Fa%20b&size=10"));
    }

    #[test]
    fn test_redact_hides_tokens() {
        let url = "https://api.example/file?home=%2Fx&access_token=secret&client_id=c";
        let redacted = redact(url);
        assert!(!redacted.contains("secret"));
        assert!(redacted.contains("client_id=c"));
    }

    #[tokio::test]
    async fn test_response_bytes_concatenates_chunks() {
        let resp = HttpResponse::from_chunks(
            206,
            vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")],
        );
        assert!(resp.is_success());
        assert_eq!(resp.bytes().await.unwrap(), Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let mock = MockTransport::new(|_| Ok(HttpResponse::from_bytes(200, "ok")));
        mock.send(HttpRequest::get("https://a.example/one")).await.unwrap();
        mock.send(HttpRequest::put("https://a.example/two")).await.unwrap();
        assert_eq!(mock.request_count(), 2);
        assert_eq!(mock.count_matching("/two"), 1);
        assert_eq!(mock.requests()[1].method, Method::Put);
    }
}
