//! # ShellCache Net
//!
//! Request/response model and network fetchers for the ShellCache offline layer.
//!
//! ## Design Goals
//!
//! 1. **One seam to the network**: everything that reaches the network goes
//!    through the [`Fetcher`] trait, so the caching core can run against a real
//!    origin ([`HttpFetcher`]), no network at all ([`OfflineFetcher`]), or a
//!    scripted one (`mock::MockFetcher`, behind the `test-util` feature).
//! 2. **Platform response semantics**: responses carry a [`ResponseType`]
//!    (`basic`, `cors`, `opaque`) derived from the page origin, because that is
//!    what decides whether a response may be stored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod http_fetcher;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use http_fetcher::{HttpFetcher, LoaderConfig, OfflineFetcher};

/// Errors that can occur in networking.
///
/// Every variant is a rejected fetch. HTTP error statuses are not errors; they
/// arrive as a [`Response`] with that status.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unavailable")]
    Offline,

    #[error("Cross-origin response blocked: {0}")]
    CorsBlocked(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
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

/// Request mode, as the page would set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin only; cross-origin targets are rejected.
    SameOrigin,
    /// Cross-origin allowed when the server opts in.
    #[default]
    Cors,
    /// Cross-origin allowed, response becomes opaque.
    NoCors,
}

/// Outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET sub-resource request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::default(),
        }
    }

    /// Create a navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Key under which this request is stored.
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }
}

/// Store key for a URL: the absolute URL without its fragment.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// Response type, following the fetch platform's filtered responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response the server opted in to.
    Cors,
    /// Cross-origin no-cors response; status and body are hidden.
    Opaque,
    /// Synthetic network error.
    Error,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }
}

/// Response handed back to the page.
///
/// Cloning is cheap: the body is reference counted.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_type: ResponseType,
}

impl Response {
    /// Create a basic response.
    pub fn new(url: Url, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            response_type: ResponseType::Basic,
        }
    }

    /// Create an opaque response. Status reads as 0 and the body is empty.
    pub fn opaque(url: Url) -> Self {
        Self {
            url,
            status: 0,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            response_type: ResponseType::Opaque,
        }
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Content-Type header, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Anything that can turn a request into a response.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. `Err` means the fetch was rejected.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
