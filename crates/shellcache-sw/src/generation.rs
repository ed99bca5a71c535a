//! Cache generations.
//!
//! A generation is one named store. The current generation is fixed when the
//! registry is built; every read and write of the fetch path goes to it and
//! nothing else, so content from a superseded generation is never served.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{CacheError, Result};
use crate::storage::{CacheEntry, CacheStorage};

/// Name of one cache generation, e.g. `app-offline-v11`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheName(String);

impl CacheName {
    /// Create a generation name. Empty names are rejected.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CacheError::config("generation name must not be empty"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of deleting every generation except the current one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// The generation that was kept.
    pub kept: Option<String>,
    /// Stale generations that were deleted.
    pub deleted: Vec<String>,
    /// Stale generations that could not be deleted, with the reason.
    pub failed: Vec<(String, String)>,
}

impl PurgeReport {
    /// True when no stale generation is left behind.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Source of truth for which named store is authoritative.
#[derive(Clone)]
pub struct GenerationRegistry {
    storage: Arc<dyn CacheStorage>,
    current: CacheName,
}

impl fmt::Debug for GenerationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRegistry")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl GenerationRegistry {
    pub fn new(storage: Arc<dyn CacheStorage>, current: CacheName) -> Self {
        Self { storage, current }
    }

    /// The current generation.
    pub fn current(&self) -> &CacheName {
        &self.current
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Open a store by name, creating it if absent.
    pub async fn open(&self, name: &CacheName) -> Result<()> {
        self.storage.open(name.as_str()).await
    }

    /// Open the current generation's store.
    pub async fn open_current(&self) -> Result<()> {
        self.open(&self.current).await
    }

    /// Every store name created and not yet deleted.
    pub async fn list_all(&self) -> Result<Vec<String>> {
        self.storage.keys().await
    }

    /// Delete a store and all its entries.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        self.storage.delete(name).await
    }

    /// Look up `key` in the current generation only.
    pub async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.storage.match_entry(self.current.as_str(), key).await
    }

    /// Write an entry into the current generation.
    pub async fn store(&self, entry: CacheEntry) -> Result<()> {
        self.storage.put(self.current.as_str(), entry).await
    }

    /// Keys stored in the current generation.
    pub async fn current_keys(&self) -> Result<Vec<String>> {
        self.storage.entry_keys(self.current.as_str()).await
    }

    /// Delete every generation except the current one.
    ///
    /// Deletion is attempted for each stale name independently; one failure
    /// does not stop the others. Only a failure to enumerate is returned as
    /// an error.
    pub async fn purge_stale(&self) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();

        for name in self.list_all().await? {
            if name == self.current.as_str() {
                report.kept = Some(name);
                continue;
            }

            match self.delete(&name).await {
                Ok(_) => {
                    info!(generation = %name, "Deleted stale cache generation");
                    report.deleted.push(name);
                }
                Err(e) => {
                    error!(
                        generation = %name,
                        current = %self.current,
                        error = %e,
                        "Failed to delete stale cache generation; it will keep using quota"
                    );
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        debug!(
            current = %self.current,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Purge finished"
        );
        Ok(report)
    }
}
