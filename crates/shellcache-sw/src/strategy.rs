//! Fetch strategies.
//!
//! The page's response never waits on a store write: writes and background
//! revalidations run as detached tasks, and their failures are logged and
//! dropped. The join handle is returned in [`FetchOutcome::background`] for
//! callers that want to observe completion.

use std::sync::Arc;

use shellcache_common::with_timeout;
use shellcache_net::{cache_key, Fetcher, NetError, Request, Response};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::ResolvedConfig;
use crate::generation::GenerationRegistry;
use crate::policy::{classify, is_cacheable, Strategy};
use crate::storage::CacheEntry;

/// Everything a strategy needs: config, the current generation, the network.
#[derive(Clone)]
pub struct FetchContext {
    pub config: Arc<ResolvedConfig>,
    pub registry: GenerationRegistry,
    pub fetcher: Arc<dyn Fetcher>,
}

/// Where the response handed to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// The stored shell document, served for an uncached navigation.
    ShellFallback,
}

/// Result of handling one request.
#[derive(Debug)]
pub struct FetchOutcome {
    pub response: Response,
    pub source: ResponseSource,
    pub strategy: Strategy,
    /// Detached store write or revalidation, if one was started.
    pub background: Option<JoinHandle<()>>,
}

impl FetchOutcome {
    fn new(response: Response, source: ResponseSource, strategy: Strategy) -> Self {
        Self {
            response,
            source,
            strategy,
            background: None,
        }
    }

    /// Wait for the background work, then return the response.
    pub async fn settle(self) -> Response {
        if let Some(handle) = self.background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background cache task did not complete");
            }
        }
        self.response
    }
}

/// Classify `request` and run the chosen strategy.
pub async fn respond(ctx: &FetchContext, request: &Request) -> Result<FetchOutcome, NetError> {
    let strategy = classify(request, &ctx.config);
    debug!(
        url = %request.url,
        strategy = strategy.as_str(),
        generation = %ctx.registry.current(),
        "Handling fetch"
    );

    match strategy {
        Strategy::NetworkFirstFallbackCache => network_first(ctx, request).await,
        Strategy::StaleWhileRevalidate => stale_while_revalidate(ctx, request).await,
        Strategy::PassThrough => pass_through(ctx.fetcher.as_ref(), request).await,
    }
}

/// Send the request to the network untouched.
pub async fn pass_through(fetcher: &dyn Fetcher, request: &Request) -> Result<FetchOutcome, NetError> {
    let response = fetcher.fetch(request).await?;
    Ok(FetchOutcome::new(
        response,
        ResponseSource::Network,
        Strategy::PassThrough,
    ))
}

async fn network_first(ctx: &FetchContext, request: &Request) -> Result<FetchOutcome, NetError> {
    const STRATEGY: Strategy = Strategy::NetworkFirstFallbackCache;

    let error = match fetch_navigation(ctx, request).await {
        Ok(response) => {
            let mut outcome = FetchOutcome::new(response, ResponseSource::Network, STRATEGY);
            outcome.background = store_detached(ctx, request.cache_key(), &outcome.response);
            return Ok(outcome);
        }
        Err(e) => e,
    };

    warn!(url = %request.url, error = %error, "Navigation failed, falling back to cache");

    if let Some(response) = cached_response(ctx, &request.cache_key()).await {
        return Ok(FetchOutcome::new(response, ResponseSource::Cache, STRATEGY));
    }
    if let Some(response) = cached_response(ctx, &cache_key(&ctx.config.shell)).await {
        debug!(url = %request.url, shell = %ctx.config.shell, "Serving shell document");
        return Ok(FetchOutcome::new(
            response,
            ResponseSource::ShellFallback,
            STRATEGY,
        ));
    }

    Err(error)
}

async fn fetch_navigation(ctx: &FetchContext, request: &Request) -> Result<Response, NetError> {
    match ctx.config.navigation_timeout {
        Some(timeout) => with_timeout(timeout, || ctx.fetcher.fetch(request))
            .await
            .map_err(|e| NetError::Timeout(e.0))?,
        None => ctx.fetcher.fetch(request).await,
    }
}

async fn stale_while_revalidate(
    ctx: &FetchContext,
    request: &Request,
) -> Result<FetchOutcome, NetError> {
    const STRATEGY: Strategy = Strategy::StaleWhileRevalidate;
    let key = request.cache_key();

    if let Some(response) = cached_response(ctx, &key).await {
        let task_ctx = ctx.clone();
        let task_request = request.clone();
        let mut outcome = FetchOutcome::new(response, ResponseSource::Cache, STRATEGY);
        outcome.background = Some(tokio::spawn(async move {
            revalidate(&task_ctx, &task_request).await;
        }));
        return Ok(outcome);
    }

    let response = ctx.fetcher.fetch(request).await?;
    let mut outcome = FetchOutcome::new(response, ResponseSource::Network, STRATEGY);
    outcome.background = store_detached(ctx, key, &outcome.response);
    Ok(outcome)
}

async fn revalidate(ctx: &FetchContext, request: &Request) {
    match ctx.fetcher.fetch(request).await {
        Ok(response) if is_cacheable(&response, ctx.config.cross_origin) => {
            write_entry(ctx, CacheEntry::from_response(request.cache_key(), &response)).await;
        }
        Ok(response) => {
            debug!(url = %request.url, status = response.status, "Revalidation response not cacheable");
        }
        Err(e) => {
            debug!(url = %request.url, error = %e, "Revalidation failed, keeping stored entry");
        }
    }
}

/// Start a detached write of `response` if it passes the write gate.
fn store_detached(ctx: &FetchContext, key: String, response: &Response) -> Option<JoinHandle<()>> {
    if !is_cacheable(response, ctx.config.cross_origin) {
        debug!(
            url = %response.url,
            status = response.status,
            response_type = response.response_type.as_str(),
            "Response not cacheable"
        );
        return None;
    }

    let entry = CacheEntry::from_response(key, response);
    let task_ctx = ctx.clone();
    Some(tokio::spawn(async move {
        write_entry(&task_ctx, entry).await;
    }))
}

async fn write_entry(ctx: &FetchContext, entry: CacheEntry) {
    let url = entry.url.clone();
    match ctx.registry.store(entry).await {
        Ok(()) => trace!(url = %url, generation = %ctx.registry.current(), "Stored"),
        Err(e) => warn!(
            url = %url,
            generation = %ctx.registry.current(),
            category = e.category(),
            error = %e,
            "Cache write failed"
        ),
    }
}

async fn cached_response(ctx: &FetchContext, key: &str) -> Option<Response> {
    let entry = match ctx.registry.lookup(key).await {
        Ok(entry) => entry?,
        Err(e) => {
            warn!(key, error = %e, "Cache lookup failed, treating as miss");
            return None;
        }
    };
    match entry.to_response() {
        Ok(response) => Some(response),
        Err(e) => {
            warn!(key, error = %e, "Stored entry unreadable, treating as miss");
            None
        }
    }
}
