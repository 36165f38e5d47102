//! Decides which requests the worker intercepts at all.

use edusync_net::Request;
use http::Method;
use tracing::trace;

/// Verdict for an incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    /// The fetch policy handles the request.
    Intercept,
    /// Left to the platform untouched.
    PassThrough(PassReason),
}

/// Why a request was not intercepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassReason {
    /// Only reads are cached.
    NotGet(Method),
    /// URL starts with a bypassed prefix.
    Bypassed(String),
}

/// Method and URL gate in front of the fetch policy.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    /// URL prefixes never intercepted; also covers whole schemes such as
    /// `chrome-extension://`.
    bypass: Vec<String>,
}

impl RequestFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter bypassing every URL that starts with one of `prefixes`.
    pub fn from_prefixes<S: AsRef<str>>(prefixes: &[S]) -> Self {
        Self {
            bypass: prefixes.iter().map(|p| p.as_ref().to_string()).collect(),
        }
    }

    pub fn check(&self, request: &Request) -> FilterVerdict {
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Not a GET, passing through");
            return FilterVerdict::PassThrough(PassReason::NotGet(request.method.clone()));
        }

        let url = request.url.as_str();
        if let Some(prefix) = self.bypass.iter().find(|p| url.starts_with(p.as_str())) {
            trace!(url = %request.url, prefix = %prefix, "Bypassed URL, passing through");
            return FilterVerdict::PassThrough(PassReason::Bypassed(prefix.clone()));
        }

        FilterVerdict::Intercept
    }
}
