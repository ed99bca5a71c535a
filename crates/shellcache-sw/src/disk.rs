//! Directory-backed cache storage.
//!
//! Each cache is one JSON document named after the percent-encoded cache
//! name with a `.cache.json` suffix; other files in the directory are not
//! caches and are left alone. Documents are replaced by writing a temp file and renaming it over
//! the old one, so a reader sees either the old or the new document.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{CacheError, Result};
use crate::storage::{CacheEntry, CacheStorage};

const EXTENSION: &str = ".cache.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCache {
    name: String,
    entries: BTreeMap<String, CacheEntry>,
}

/// Cache storage persisted under a directory.
#[derive(Debug)]
pub struct DiskStorage {
    root: PathBuf,
    // Serializes read-modify-write cycles on cache documents.
    write_lock: Mutex<()>,
}

impl DiskStorage {
    /// Use `root` as the storage directory, creating it if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "DiskStorage opened");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}{EXTENSION}", urlencoding::encode(name)))
    }

    async fn load(&self, name: &str) -> Result<Option<StoredCache>> {
        match fs::read(self.path_for(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, cache: &StoredCache) -> Result<()> {
        let path = self.path_for(&cache.name);
        let tmp = path.with_file_name(format!(
            "{}{EXTENSION}.tmp",
            urlencoding::encode(&cache.name)
        ));
        fs::write(&tmp, serde_json::to_vec_pretty(cache)?).await?;
        fs::rename(&tmp, &path).await?;
        trace!(path = %path.display(), entries = cache.entries.len(), "Cache document written");
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.load(name).await?.is_none() {
            self.save(&StoredCache {
                name: name.to_string(),
                entries: BTreeMap::new(),
            })
            .await?;
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(name)).await?)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let file_name = item.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|f| f.strip_suffix(EXTENSION))
            else {
                continue;
            };
            let name = urlencoding::decode(stem)
                .map_err(|e| CacheError::Storage(format!("bad cache file name {stem}: {e}")))?;
            names.push(name.into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn match_entry(&self, name: &str, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self
            .load(name)
            .await?
            .and_then(|mut cache| cache.entries.remove(key)))
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut cache = self
            .load(name)
            .await?
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        cache.entries.insert(entry.url.clone(), entry);
        self.save(&cache).await
    }

    async fn entry_keys(&self, name: &str) -> Result<Vec<String>> {
        let cache = self
            .load(name)
            .await?
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        Ok(cache.entries.into_keys().collect())
    }
}
