//! Named cache stores and the in-memory backend.
//!
//! ```text
//! CacheStorage (caches)
//!     └── cache name (one per generation)
//!             └── request key → CacheEntry
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use shellcache_net::{Response, ResponseType};
use tokio::sync::RwLock;
use url::Url;

use crate::error::{CacheError, Result};

// ==================== Cache Entry ====================

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request key (absolute URL, no fragment).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in received order. Repeated names keep every value.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Response type at capture time.
    pub response_type: ResponseType,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot `response` under `key`.
    pub fn from_response(key: impl Into<String>, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.into(),
            method: "GET".to_string(),
            status: response.status,
            headers,
            body: response.body.to_vec(),
            response_type: response.response_type,
            cached_at: now_millis(),
        }
    }

    /// Rebuild the response this entry was captured from.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)
            .map_err(|e| CacheError::Storage(format!("corrupt entry key {}: {e}", self.url)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        Ok(Response {
            url,
            status: self.status,
            headers,
            body: self.body.clone().into(),
            response_type: self.response_type,
        })
    }

    /// Bytes this entry counts against a quota.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Cache Storage ====================

/// The platform store: named caches of request → response entries.
///
/// Every operation is atomic per entry. Writing into a cache that does not
/// exist fails with [`CacheError::NotFound`] rather than recreating it, so a
/// late write can never bring back a deleted generation.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if absent.
    async fn open(&self, name: &str) -> Result<()>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> Result<bool>;

    /// All cache names, sorted.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Delete a cache and all its entries. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Look up one entry.
    async fn match_entry(&self, name: &str, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or replace the entry stored under `entry.url`.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<()>;

    /// All entry keys of a cache, sorted.
    async fn entry_keys(&self, name: &str) -> Result<Vec<String>>;
}

/// In-memory cache storage with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    caches: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
    quota: Option<u64>,
}

impl MemoryStorage {
    /// Create unbounded storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage that refuses writes past `bytes` of stored bodies.
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            caches: RwLock::default(),
            quota: Some(bytes),
        }
    }

    /// Bytes currently stored across all caches.
    pub async fn usage(&self) -> u64 {
        usage_of(&*self.caches.read().await)
    }
}

fn usage_of(caches: &HashMap<String, HashMap<String, CacheEntry>>) -> u64 {
    caches
        .values()
        .flat_map(|cache| cache.values())
        .map(CacheEntry::size)
        .sum()
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<()> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn match_entry(&self, name: &str, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.get(key))
            .cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<()> {
        let mut caches = self.caches.write().await;

        if let Some(quota) = self.quota {
            let replaced = caches
                .get(name)
                .and_then(|cache| cache.get(&entry.url))
                .map(CacheEntry::size)
                .unwrap_or(0);
            let needed = usage_of(&caches) - replaced + entry.size();
            if needed > quota {
                return Err(CacheError::QuotaExceeded { needed, quota });
            }
        }

        let cache = caches
            .get_mut(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        cache.insert(entry.url.clone(), entry);
        Ok(())
    }

    async fn entry_keys(&self, name: &str) -> Result<Vec<String>> {
        let caches = self.caches.read().await;
        let cache = caches
            .get(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        let mut keys: Vec<String> = cache.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, body: &str) -> CacheEntry {
        let response = Response::new(Url::parse(url).unwrap(), 200, body.to_string());
        CacheEntry::from_response(url, &response)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let storage = MemoryStorage::new();
        storage.open("v1").await.unwrap();
        storage
            .put("v1", entry("https://app.example/", "home"))
            .await
            .unwrap();
        storage.open("v1").await.unwrap();

        assert_eq!(storage.keys().await.unwrap(), vec!["v1"]);
        assert_eq!(storage.entry_keys("v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_replaces_under_same_key() {
        let storage = MemoryStorage::new();
        storage.open("v1").await.unwrap();
        storage
            .put("v1", entry("https://app.example/app.js", "old"))
            .await
            .unwrap();
        storage
            .put("v1", entry("https://app.example/app.js", "new"))
            .await
            .unwrap();

        let found = storage
            .match_entry("v1", "https://app.example/app.js")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body, b"new");
        assert_eq!(storage.entry_keys("v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_into_deleted_cache_fails() {
        let storage = MemoryStorage::new();
        storage.open("v1").await.unwrap();
        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());

        let result = storage.put("v1", entry("https://app.example/", "x")).await;
        assert!(matches!(result, Err(CacheError::NotFound(_))));
        assert!(!storage.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_rejects_and_leaves_store_unchanged() {
        let storage = MemoryStorage::with_quota(8);
        storage.open("v1").await.unwrap();
        storage
            .put("v1", entry("https://app.example/a", "12345"))
            .await
            .unwrap();

        let result = storage
            .put("v1", entry("https://app.example/b", "12345"))
            .await;
        assert!(matches!(
            result,
            Err(CacheError::QuotaExceeded { needed: 10, quota: 8 })
        ));
        assert_eq!(storage.usage().await, 5);

        // Replacing an entry only counts the difference
        storage
            .put("v1", entry("https://app.example/a", "12345678"))
            .await
            .unwrap();
        assert_eq!(storage.usage().await, 8);
    }

    #[test]
    fn test_entry_round_trips_response_fields() {
        let mut response = Response::new(
            Url::parse("https://app.example/style.css").unwrap(),
            200,
            "body{}",
        )
        .with_header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/css"),
        );
        response
            .headers
            .append(http::header::VARY, HeaderValue::from_static("accept-encoding"));
        response
            .headers
            .append(http::header::VARY, HeaderValue::from_static("accept-language"));
        response
            .headers
            .append(http::header::LINK, HeaderValue::from_static("</app.js>; rel=preload"));
        response
            .headers
            .append(http::header::LINK, HeaderValue::from_static("</app.css>; rel=preload"));

        let entry = CacheEntry::from_response(response.url.as_str(), &response);
        let restored = entry.to_response().unwrap();

        assert_eq!(restored.status, 200);
        assert_eq!(restored.content_type(), Some("text/css"));
        let vary: Vec<_> = restored.headers.get_all(http::header::VARY).iter().collect();
        assert_eq!(vary, vec!["accept-encoding", "accept-language"]);
        assert_eq!(restored.headers.get_all(http::header::LINK).iter().count(), 2);
        assert_eq!(restored.headers.len(), response.headers.len());
        assert_eq!(restored.body, response.body);
        assert_eq!(restored.response_type, ResponseType::Basic);
    }

    #[test]
    fn test_entry_body_serializes_as_base64() {
        let entry = entry("https://app.example/", "hi");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["body"], "aGk=");
        assert_eq!(json["response_type"], "basic");

        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
