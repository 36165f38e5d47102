//! In-memory network for offline tests and fixtures.
//!
//! A [`StaticNetwork`] answers from a fixed route table, can be switched
//! offline at runtime, and records every request it sees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::trace;
use url::Url;

use crate::{Fetcher, NetError, Request, Response, ResponseType};

/// Canned answer for one route.
#[derive(Debug, Clone)]
pub struct StaticResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub response_type: ResponseType,
    pub redirected: bool,
}

impl StaticResponse {
    /// Same-origin `200 OK` with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::status(200, body)
    }

    /// Same-origin response with an arbitrary status.
    pub fn status(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            response_type: ResponseType::Basic,
            redirected: false,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Served from another origin through CORS.
    pub fn cross_origin(mut self) -> Self {
        self.response_type = ResponseType::Cors;
        self
    }

    /// Reached through a redirect chain.
    pub fn redirected(mut self) -> Self {
        self.redirected = true;
        self
    }

    fn to_response(&self, request: &Request) -> Response {
        let mut response = Response::new(self.status, self.body.clone())
            .with_url(request.url.clone())
            .with_type(self.response_type)
            .with_redirected(self.redirected);
        response.request_id = Some(request.id);
        for (name, value) in &self.headers {
            response = response.with_header(name, value);
        }
        response
    }
}

#[derive(Debug, Clone)]
enum Route {
    Respond(StaticResponse),
    Fail(String),
}

/// Route-table [`Fetcher`].
///
/// Unrouted URLs answer `404 Not Found`.
#[derive(Debug, Default)]
pub struct StaticNetwork {
    routes: HashMap<String, Route>,
    offline: AtomicBool,
    calls: AtomicUsize,
    log: Mutex<Vec<Url>>,
}

impl StaticNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with `response`.
    pub fn with_route(mut self, url: &str, response: StaticResponse) -> Self {
        self.routes.insert(url.to_string(), Route::Respond(response));
        self
    }

    /// Fail every request to `url` at the transport level.
    pub fn with_failure(mut self, url: &str, reason: &str) -> Self {
        self.routes
            .insert(url.to_string(), Route::Fail(reason.to_string()));
        self
    }

    /// Fail every request until [`StaticNetwork::go_online`].
    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn go_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    /// Total number of requests seen, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of requests seen for `url`.
    pub async fn calls_to(&self, url: &str) -> usize {
        self.log
            .lock()
            .await
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }
}

#[async_trait]
impl Fetcher for StaticNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .await
            .push(request.url.clone());

        if self.offline.load(Ordering::SeqCst) {
            trace!(url = %request.url, "Static network offline");
            return Err(NetError::Offline(request.url.to_string()));
        }

        match self.routes.get(request.url.as_str()) {
            Some(Route::Respond(canned)) => Ok(canned.to_response(&request)),
            Some(Route::Fail(reason)) => Err(NetError::RequestFailed(reason.clone())),
            None => Ok(StaticResponse::status(404, "Not Found").to_response(&request)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_routes_and_default_404() {
        let network = StaticNetwork::new().with_route(
            "https://school.example/",
            StaticResponse::ok("<h1>home</h1>").header("Content-Type", "text/html"),
        );

        let home = network
            .fetch(Request::get(url("https://school.example/")))
            .await
            .unwrap();
        assert_eq!(home.status, 200);
        assert_eq!(home.response_type, ResponseType::Basic);
        assert_eq!(home.content_type(), Some(mime::TEXT_HTML));
        assert_eq!(home.text().await.unwrap(), "<h1>home</h1>");

        let missing = network
            .fetch(Request::get(url("https://school.example/nope")))
            .await
            .unwrap();
        assert_eq!(missing.status, 404);
        assert_eq!(network.calls(), 2);
    }

    #[tokio::test]
    async fn test_offline_and_failures() {
        let network = StaticNetwork::new()
            .with_route("https://school.example/", StaticResponse::ok("home"))
            .with_failure("https://school.example/flaky", "dns lookup failed");

        let err = network
            .fetch(Request::get(url("https://school.example/flaky")))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::RequestFailed(_)));

        network.go_offline();
        let err = network
            .fetch(Request::get(url("https://school.example/")))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Offline(_)));

        network.go_online();
        assert!(network
            .fetch(Request::get(url("https://school.example/")))
            .await
            .is_ok());
        assert_eq!(network.calls_to("https://school.example/").await, 2);
    }
}
