//! Request classification and the store-write gate.

use http::Method;
use shellcache_net::{Request, Response, ResponseType};

use crate::config::{CrossOriginCaching, ResolvedConfig};

/// How a request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Network, store on success, fall back to the stored entry or the shell.
    NetworkFirstFallbackCache,
    /// Stored entry now, refresh from network in the background.
    StaleWhileRevalidate,
    /// Straight to the network, nothing stored.
    PassThrough,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::NetworkFirstFallbackCache => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
            Strategy::PassThrough => "pass-through",
        }
    }
}

/// Pick the strategy for a request.
///
/// Evaluated in order: non-GET and non-http(s) requests pass through;
/// same-origin navigations are network-first; cross-origin navigations are
/// outside the worker's scope and pass through; everything else is
/// stale-while-revalidate.
pub fn classify(request: &Request, config: &ResolvedConfig) -> Strategy {
    if request.method != Method::GET {
        return Strategy::PassThrough;
    }
    if !matches!(request.url.scheme(), "http" | "https") {
        return Strategy::PassThrough;
    }
    if request.is_navigation() {
        return if config.is_same_origin(&request.url) {
            Strategy::NetworkFirstFallbackCache
        } else {
            Strategy::PassThrough
        };
    }
    Strategy::StaleWhileRevalidate
}

/// Whether a network response may be written to the store.
///
/// Readable responses must be exactly 200. Opaque responses hide their
/// status, so admitting them at all is the policy's call.
pub fn is_cacheable(response: &Response, policy: CrossOriginCaching) -> bool {
    if !policy.admits(response.response_type) {
        return false;
    }
    match response.response_type {
        ResponseType::Opaque => true,
        _ => response.status == 200,
    }
}
