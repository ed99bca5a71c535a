//! Worker configuration.
//!
//! The generation name and precache manifest are deployment inputs. They are
//! loaded from JSON (or built in code), validated once by
//! [`WorkerConfig::resolve`], and injected into the worker.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellcache_common::RetryConfig;
use shellcache_net::{cache_key, ResponseType};
use tracing::warn;
use url::Url;

use crate::error::{CacheError, Result};
use crate::generation::CacheName;

/// Which cross-origin responses may be written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossOriginCaching {
    /// Only same-origin `basic` responses.
    #[default]
    Deny,
    /// `basic` and `cors` responses.
    Cors,
    /// `basic`, `cors` and `opaque` responses.
    CorsAndOpaque,
}

impl CrossOriginCaching {
    /// Whether a response of this type may be stored at all.
    pub fn admits(&self, response_type: ResponseType) -> bool {
        match response_type {
            ResponseType::Basic => true,
            ResponseType::Cors => matches!(self, Self::Cors | Self::CorsAndOpaque),
            ResponseType::Opaque => matches!(self, Self::CorsAndOpaque),
            ResponseType::Error => false,
        }
    }
}

/// Retry settings for precache fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 100,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(self) -> RetryConfig {
        RetryConfig::attempts(self.max_attempts, Duration::from_millis(self.initial_delay_ms))
    }
}

fn default_shell() -> String {
    "/index.html".to_string()
}

/// Worker configuration as written by the deployer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Current cache generation. Bump it to invalidate everything cached before.
    pub generation: String,

    /// Origin of the application; relative manifest entries resolve against it.
    pub origin: Url,

    /// Precache manifest, in install order.
    #[serde(default)]
    pub manifest: Vec<String>,

    /// Shell document served to navigations that miss the cache while offline.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Cross-origin store policy.
    #[serde(default)]
    pub cross_origin: CrossOriginCaching,

    /// Give up on the network for navigations after this long.
    #[serde(default)]
    pub navigation_timeout_ms: Option<u64>,

    /// Retries of rejected precache fetches.
    #[serde(default)]
    pub precache_retry: RetrySettings,
}

impl WorkerConfig {
    pub fn new(generation: impl Into<String>, origin: Url) -> Self {
        Self {
            generation: generation.into(),
            origin,
            manifest: Vec::new(),
            shell: default_shell(),
            cross_origin: CrossOriginCaching::default(),
            navigation_timeout_ms: None,
            precache_retry: RetrySettings::default(),
        }
    }

    pub fn with_manifest<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest = entries.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_cross_origin(mut self, policy: CrossOriginCaching) -> Self {
        self.cross_origin = policy;
        self
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_precache_retry(mut self, retry: RetrySettings) -> Self {
        self.precache_retry = retry;
        self
    }

    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CacheError::config(format!("invalid config: {e}")))
    }

    /// Load a JSON config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            CacheError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Validate and resolve every URL.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let generation = CacheName::new(self.generation.clone())?;

        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(CacheError::config(format!(
                "origin must be http(s): {}",
                self.origin
            )));
        }

        let mut manifest: Vec<Url> = Vec::with_capacity(self.manifest.len());
        for raw in &self.manifest {
            let url = self.join(raw)?;
            if manifest.iter().any(|seen| cache_key(seen) == cache_key(&url)) {
                warn!(entry = %raw, "Duplicate precache manifest entry dropped");
                continue;
            }
            manifest.push(url);
        }

        let shell = self.join(&self.shell)?;
        if !manifest.iter().any(|u| cache_key(u) == cache_key(&shell)) {
            warn!(shell = %shell, "Shell document is not in the precache manifest");
        }

        Ok(ResolvedConfig {
            generation,
            origin: self.origin.clone(),
            manifest,
            shell,
            cross_origin: self.cross_origin,
            navigation_timeout: self.navigation_timeout_ms.map(Duration::from_millis),
            precache_retry: self.precache_retry.to_retry_config(),
        })
    }

    fn join(&self, raw: &str) -> Result<Url> {
        let url = self
            .origin
            .join(raw)
            .map_err(|e| CacheError::config(format!("bad URL {raw:?}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CacheError::config(format!("URL must be http(s): {url}")));
        }
        Ok(url)
    }
}

/// Validated configuration with every URL resolved.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub generation: CacheName,
    pub origin: Url,
    pub manifest: Vec<Url>,
    pub shell: Url,
    pub cross_origin: CrossOriginCaching,
    pub navigation_timeout: Option<Duration>,
    pub precache_retry: RetryConfig,
}

impl ResolvedConfig {
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }
}
