//! Install and activate handlers.
//!
//! Both are plain functions of the resolved config, the registry and the
//! network; the worker and registration only sequence them.

use serde::Serialize;
use shellcache_common::retry_with_backoff;
use shellcache_net::{cache_key, Fetcher, Request, RequestMode};
use tracing::{error, info, warn};
use url::Url;

use crate::config::{CrossOriginCaching, ResolvedConfig};
use crate::error::Result;
use crate::generation::{CacheName, GenerationRegistry, PurgeReport};
use crate::policy::is_cacheable;
use crate::storage::CacheEntry;

/// What install put into the new generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub generation: CacheName,
    /// Manifest URLs now stored, in manifest order.
    pub cached: Vec<Url>,
    /// Manifest URLs that were skipped, with the reason.
    pub failed: Vec<(Url, String)>,
}

impl InstallReport {
    /// True when every manifest entry was stored.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn precache_request(url: &Url, config: &ResolvedConfig) -> Request {
    let request = Request::get(url.clone());
    if !config.is_same_origin(url) && config.cross_origin == CrossOriginCaching::CorsAndOpaque {
        request.mode(RequestMode::NoCors)
    } else {
        request
    }
}

/// Open the current generation and store every manifest URL.
///
/// Each manifest entry is fetched and stored on its own: a rejected fetch or
/// an uncacheable response skips that entry and install carries on. Storage
/// errors (opening the store, writing an entry, quota) abort the install.
pub async fn install(
    config: &ResolvedConfig,
    registry: &GenerationRegistry,
    fetcher: &dyn Fetcher,
) -> Result<InstallReport> {
    let generation = registry.current().clone();
    info!(generation = %generation, entries = config.manifest.len(), "Installing");

    if let Err(e) = registry.open_current().await {
        error!(generation = %generation, category = e.category(), error = %e, "Cannot open cache");
        return Err(e);
    }

    let mut report = InstallReport {
        generation,
        cached: Vec::new(),
        failed: Vec::new(),
    };

    for url in &config.manifest {
        let request = precache_request(url, config);
        let fetched = retry_with_backoff(&config.precache_retry, || fetcher.fetch(&request)).await;

        match fetched {
            Ok(response) if is_cacheable(&response, config.cross_origin) => {
                let entry = CacheEntry::from_response(cache_key(url), &response);
                if let Err(e) = registry.store(entry).await {
                    error!(url = %url, category = e.category(), error = %e, "Precache write failed");
                    return Err(e);
                }
                report.cached.push(url.clone());
            }
            Ok(response) => {
                let reason = format!(
                    "not cacheable: status {} ({})",
                    response.status,
                    response.response_type.as_str()
                );
                warn!(url = %url, %reason, "Skipping precache entry");
                report.failed.push((url.clone(), reason));
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Skipping precache entry");
                report.failed.push((url.clone(), e.to_string()));
            }
        }
    }

    info!(
        generation = %report.generation,
        cached = report.cached.len(),
        failed = report.failed.len(),
        "Install finished"
    );
    Ok(report)
}

/// Delete every generation except the current one.
///
/// Fails only when the store cannot be enumerated; individual deletion
/// failures are listed in the report.
pub async fn activate(registry: &GenerationRegistry) -> Result<PurgeReport> {
    info!(generation = %registry.current(), "Activating");
    let report = registry.purge_stale().await?;
    if !report.is_clean() {
        error!(
            generation = %registry.current(),
            leaked = ?report.failed,
            "Stale cache generations survived activation"
        );
    }
    Ok(report)
}
