//! # EduSync Net
//!
//! Request/response model and network transport for the EduSync offline
//! worker.
//!
//! ## Design Goals
//!
//! 1. **Fetch-shaped types**: requests carry a mode, responses carry a type
//!    (`basic`, `cors`, `opaque`, ...) so caching policy can be decided on them
//! 2. **Single-consumption bodies**: a [`Response`] body is read at most once;
//!    [`Response::tee`] is the only way to obtain two readable copies
//! 3. **Pluggable transport**: everything above this crate talks to a
//!    [`Fetcher`], backed by reqwest in production and by [`StaticNetwork`] in
//!    tests

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use url::Url;

pub mod stub;

pub use stub::{StaticNetwork, StaticResponse};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Offline: {0}")]
    Offline(String),

    #[error("Body stream failed: {0}")]
    Body(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<NetError> for edusync_common::EduSyncError {
    fn from(err: NetError) -> Self {
        edusync_common::EduSyncError::network_with_source("network request failed", err)
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, mirroring `Request.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Cross-origin without CORS; cross-origin answers are opaque.
    NoCors,
    /// Cross-origin with CORS.
    #[default]
    Cors,
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
    /// Never send cookies.
    Omit,
    /// Send cookies only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send cookies.
    Include,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub credentials: CredentialsMode,
    pub mode: RequestMode,
    pub referrer: Option<Url>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            credentials: CredentialsMode::SameOrigin,
            mode: RequestMode::Cors,
            referrer: None,
        }
    }

    /// Create a navigation (top-level document) request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            credentials: CredentialsMode::Include,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set referrer.
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Whether this request is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Response type, mirroring `Response.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin network response.
    Basic,
    /// Cross-origin response exposed through CORS.
    Cors,
    /// Constructed locally.
    #[default]
    Default,
    /// Network error.
    Error,
    /// Cross-origin `no-cors` response; status and body hidden.
    Opaque,
    /// Redirect captured with `redirect: "manual"`.
    OpaqueRedirect,
}

/// HTTP response.
#[derive(Debug)]
pub struct Response {
    pub request_id: Option<RequestId>,
    pub url: Option<Url>,
    /// Status code; `0` for error and opaque responses.
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub redirected: bool,
    body: ResponseBody,
}

/// Response body variants.
#[derive(Debug)]
enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
    /// One side of a teed stream.
    Branch(mpsc::UnboundedReceiver<Result<Bytes, NetError>>),
    /// Empty.
    Empty,
}

impl ResponseBody {
    async fn collect(self) -> Result<Bytes, NetError> {
        match self {
            ResponseBody::Full(b) => Ok(b),
            ResponseBody::Stream(mut rx) => {
                let mut chunks = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    chunks.push(chunk?);
                }
                Ok(chunks.into_iter().flatten().collect())
            }
            ResponseBody::Branch(mut rx) => {
                let mut chunks = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    chunks.push(chunk?);
                }
                Ok(chunks.into_iter().flatten().collect())
            }
            ResponseBody::Empty => Ok(Bytes::new()),
        }
    }
}

impl Response {
    /// Create a locally constructed response.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            request_id: None,
            url: None,
            status,
            status_text: canonical_reason(status),
            headers: HeaderMap::new(),
            response_type: ResponseType::Default,
            redirected: false,
            body: ResponseBody::Full(body.into()),
        }
    }

    /// Create a response whose body arrives over a channel.
    pub fn streaming(status: u16, rx: mpsc::Receiver<Result<Bytes, NetError>>) -> Self {
        Self {
            body: ResponseBody::Stream(rx),
            ..Self::new(status, Bytes::new())
        }
    }

    /// Create a network error response (`Response.error()`).
    pub fn error() -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            response_type: ResponseType::Error,
            body: ResponseBody::Empty,
            ..Self::new(0, Bytes::new())
        }
    }

    /// Set a header, ignoring invalid names or values.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.headers.append(n, v);
        }
        self
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Mark the response as the end of a redirect chain.
    pub fn with_redirected(mut self, redirected: bool) -> Self {
        self.redirected = redirected;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parsed `Content-Type` header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Headers as ordered `(name, value)` pairs; non-UTF-8 values are skipped.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }

    /// Get the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        self.body.collect().await
    }

    /// Get the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::Body(e.to_string()))
    }

    /// Split into two independent responses with the same head and body.
    ///
    /// Returns at once. A streaming body is forwarded chunk by chunk to both
    /// sides as it arrives; a stream failure reaches both readers.
    pub fn tee(self) -> (Response, Response) {
        let (body, copy_body) = match self.body {
            ResponseBody::Full(bytes) => (ResponseBody::Full(bytes.clone()), ResponseBody::Full(bytes)),
            ResponseBody::Empty => (ResponseBody::Empty, ResponseBody::Empty),
            ResponseBody::Stream(rx) => {
                let (a, b) = tee_chunks(ChunkSource::Bounded(rx));
                (ResponseBody::Branch(a), ResponseBody::Branch(b))
            }
            ResponseBody::Branch(rx) => {
                let (a, b) = tee_chunks(ChunkSource::Unbounded(rx));
                (ResponseBody::Branch(a), ResponseBody::Branch(b))
            }
        };

        let copy = Response {
            request_id: self.request_id,
            url: self.url.clone(),
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            response_type: self.response_type,
            redirected: self.redirected,
            body: copy_body,
        };
        (Response { body, ..self }, copy)
    }
}

type Chunk = Result<Bytes, NetError>;

enum ChunkSource {
    Bounded(mpsc::Receiver<Chunk>),
    Unbounded(mpsc::UnboundedReceiver<Chunk>),
}

impl ChunkSource {
    async fn recv(&mut self) -> Option<Chunk> {
        match self {
            ChunkSource::Bounded(rx) => rx.recv().await,
            ChunkSource::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Forward every chunk of `source` to two receivers. A side whose reader
/// went away is skipped; the other keeps streaming.
fn tee_chunks(
    mut source: ChunkSource,
) -> (mpsc::UnboundedReceiver<Chunk>, mpsc::UnboundedReceiver<Chunk>) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(chunk) = source.recv().await {
            let (a, b, failed) = match chunk {
                Ok(bytes) => (Ok(bytes.clone()), Ok(bytes), false),
                Err(e) => {
                    let reason = e.to_string();
                    (Err(NetError::Body(reason.clone())), Err(NetError::Body(reason)), true)
                }
            };
            let a_gone = tx_a.send(a).is_err();
            let b_gone = tx_b.send(b).is_err();
            if failed || (a_gone && b_gone) {
                break;
            }
        }
    });

    (rx_a, rx_b)
}

fn canonical_reason(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or_default()
        .to_string()
}

/// Network transport consumed by the offline worker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issue a request. `Err` means the transport itself failed (offline, DNS,
    /// timeout); HTTP error statuses are `Ok` responses.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
    /// Capacity of the body chunk channel.
    pub body_buffer: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("EduSync-Worker/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
            body_buffer: 16,
        }
    }
}

/// reqwest-backed [`Fetcher`].
///
/// Responses from `origin` are `basic`; everything else is `cors` or
/// `opaque`.
pub struct ResourceLoader {
    client: Client,
    origin: Url,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(origin: Url, config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = %origin, "ResourceLoader initialized");

        Ok(Self {
            client,
            origin,
            config,
        })
    }

    /// Classify a response by where it came from relative to the app origin.
    fn classify(&self, request: &Request, final_url: &Url) -> ResponseType {
        if self.origin.origin() == final_url.origin() {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }

    /// Fetch a URL.
    pub async fn load(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, mode = ?request.mode, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(ref referrer) = request.referrer {
            req_builder = req_builder.header("Referer", referrer.as_str());
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        req_builder = req_builder.timeout(timeout);

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        let final_url = response.url().clone();
        let redirected = final_url != request.url;
        let response_type = self.classify(&request, &final_url);

        if response_type == ResponseType::Opaque {
            trace!(url = %final_url, "Opaque response, hiding status and body");
            return Ok(Response {
                request_id: Some(request.id),
                url: Some(final_url),
                status: 0,
                status_text: String::new(),
                headers: HeaderMap::new(),
                response_type,
                redirected,
                body: ResponseBody::Empty,
            });
        }

        let status = response.status();
        let headers = response.headers().clone();

        trace!(
            url = %final_url,
            status = %status,
            response_type = ?response_type,
            redirected,
            content_length = ?response.content_length(),
            "Response received"
        );

        let (tx, rx) = mpsc::channel(self.config.body_buffer.max(1));
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| NetError::Body(e.to_string()));
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Response {
            request_id: Some(request.id),
            url: Some(final_url),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            response_type,
            redirected,
            body: ResponseBody::Stream(rx),
        })
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.load(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com").unwrap();
        let request = Request::get(url.clone())
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/json"),
            )
            .timeout(Duration::from_secs(10));

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_navigate_request() {
        let request = Request::navigate(Url::parse("https://example.com/").unwrap());
        assert!(request.is_navigation());
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.credentials, CredentialsMode::Include);
    }

    #[test]
    fn test_net_error_is_network_category() {
        let err: edusync_common::EduSyncError = NetError::Offline("https://example.com/".into()).into();
        assert_eq!(err.category(), "network");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_error_response() {
        let response = Response::error();
        assert_eq!(response.status, 0);
        assert_eq!(response.response_type, ResponseType::Error);
        assert!(!response.ok());
    }

    #[test]
    fn test_constructed_response() {
        let response = Response::new(408, "Network error happened")
            .with_header("Content-Type", "text/plain");
        assert_eq!(response.status_text, "Request Timeout");
        assert_eq!(response.response_type, ResponseType::Default);
        assert_eq!(response.content_type(), Some(mime::TEXT_PLAIN));
    }

    #[tokio::test]
    async fn test_tee_returns_before_body_arrives() {
        let (tx, rx) = mpsc::channel(4);
        let response = Response::streaming(200, rx).with_type(ResponseType::Basic);
        let (a, b) = response.tee();
        assert_eq!(a.response_type, ResponseType::Basic);
        assert_eq!(b.status, 200);

        tx.send(Ok(Bytes::from_static(b"hello "))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"world"))).await.unwrap();
        drop(tx);

        assert_eq!(a.text().await.unwrap(), "hello world");
        assert_eq!(b.text().await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_tee_one_side_dropped() {
        let (tx, rx) = mpsc::channel(4);
        let (a, b) = Response::streaming(200, rx).tee();
        drop(b);

        tx.send(Ok(Bytes::from_static(b"still "))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"here"))).await.unwrap();
        drop(tx);
        assert_eq!(a.text().await.unwrap(), "still here");
    }

    #[tokio::test]
    async fn test_tee_broken_stream_reaches_both_sides() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"partial"))).await.unwrap();
        tx.send(Err(NetError::Body("connection reset".into())))
            .await
            .unwrap();
        drop(tx);

        let (a, b) = Response::streaming(200, rx).tee();
        assert!(matches!(a.bytes().await, Err(NetError::Body(_))));
        assert!(matches!(b.bytes().await, Err(NetError::Body(_))));
    }

    #[test]
    fn test_tee_full_body() {
        let (a, b) = Response::new(200, "same").tee();
        assert_eq!(a.status, b.status);
        assert_eq!(a.headers, b.headers);
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("EduSync-Worker/"));
        assert!(config.cookies_enabled);
    }

    #[test]
    fn test_classify() {
        let origin = Url::parse("https://school.example/").unwrap();
        let loader = ResourceLoader::new(origin, LoaderConfig::default()).unwrap();

        let same = Url::parse("https://school.example/static/app.js").unwrap();
        let other = Url::parse("https://cdn.example/lib.js").unwrap();

        let request = Request::get(same.clone());
        assert_eq!(loader.classify(&request, &same), ResponseType::Basic);
        assert_eq!(loader.classify(&request, &other), ResponseType::Cors);

        let no_cors = Request::get(other.clone()).mode(RequestMode::NoCors);
        assert_eq!(loader.classify(&no_cors, &other), ResponseType::Opaque);
    }
}
