//! Scripted fetcher for exercising caching code without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, RwLock};
use tracing::trace;
use url::Url;

use crate::{cache_key, Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Reply {
    Respond(Response),
    Reject,
}

#[derive(Debug, Clone)]
struct Route {
    reply: Reply,
    gate: Option<Arc<Notify>>,
}

/// A fetcher that answers from a route table.
///
/// Unrouted URLs get a 404, the way a static file server would answer.
#[derive(Debug, Default)]
pub struct MockFetcher {
    routes: RwLock<HashMap<String, Route>>,
    hits: RwLock<HashMap<String, usize>>,
    offline: AtomicBool,
}

fn key(url: &str) -> String {
    Url::parse(url)
        .map(|u| cache_key(&u))
        .unwrap_or_else(|_| url.to_string())
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with a basic response.
    pub async fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        let parsed = Url::parse(url).unwrap_or_else(|e| panic!("invalid mock url {url}: {e}"));
        self.respond_with(Response::new(parsed, status, body)).await;
    }

    /// Answer the response's own URL with `response`.
    pub async fn respond_with(&self, response: Response) {
        let route_key = cache_key(&response.url);
        self.insert(route_key, Reply::Respond(response)).await;
    }

    /// Reject fetches of `url` as a network failure.
    pub async fn reject(&self, url: &str) {
        self.insert(key(url), Reply::Reject).await;
    }

    /// Hold fetches of `url` until the returned gate is notified.
    pub async fn gate(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        let mut routes = self.routes.write().await;
        if let Some(route) = routes.get_mut(&key(url)) {
            route.gate = Some(gate.clone());
        }
        gate
    }

    /// Reject every request while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches seen for `url`.
    pub async fn hits(&self, url: &str) -> usize {
        self.hits.read().await.get(&key(url)).copied().unwrap_or(0)
    }

    async fn insert(&self, route_key: String, reply: Reply) {
        let mut routes = self.routes.write().await;
        let gate = routes.get(&route_key).and_then(|r| r.gate.clone());
        routes.insert(route_key, Route { reply, gate });
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let route_key = request.cache_key();
        *self.hits.write().await.entry(route_key.clone()).or_insert(0) += 1;

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }

        let route = self.routes.read().await.get(&route_key).cloned();
        let Some(route) = route else {
            trace!(url = %request.url, "No mock route, answering 404");
            return Ok(Response::new(request.url.clone(), 404, "Not Found"));
        };

        if let Some(gate) = route.gate {
            gate.notified().await;
        }

        match route.reply {
            Reply::Respond(response) => Ok(response),
            Reply::Reject => Err(NetError::RequestFailed(format!(
                "mock rejected {}",
                request.url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_routes_and_hits() {
        let mock = MockFetcher::new();
        mock.respond("https://app.example/app.js", 200, "js").await;

        let response = mock.fetch(&get("https://app.example/app.js")).await.unwrap();
        assert_eq!(response.body, Bytes::from("js"));
        assert_eq!(mock.hits("https://app.example/app.js").await, 1);

        let missing = mock.fetch(&get("https://app.example/nope")).await.unwrap();
        assert_eq!(missing.status, 404);
    }

    #[tokio::test]
    async fn test_reject_and_offline() {
        let mock = MockFetcher::new();
        mock.respond("https://app.example/", 200, "home").await;
        mock.reject("https://app.example/flaky").await;

        assert!(mock.fetch(&get("https://app.example/flaky")).await.is_err());

        mock.set_offline(true);
        assert!(matches!(
            mock.fetch(&get("https://app.example/")).await,
            Err(NetError::Offline)
        ));
        mock.set_offline(false);
        assert!(mock.fetch(&get("https://app.example/")).await.is_ok());
    }

    #[tokio::test]
    async fn test_gate_survives_route_replacement() {
        let mock = Arc::new(MockFetcher::new());
        mock.respond("https://app.example/data.json", 200, "v1").await;
        let gate = mock.gate("https://app.example/data.json").await;
        mock.respond("https://app.example/data.json", 200, "v2").await;

        let task = {
            let mock = mock.clone();
            tokio::spawn(async move { mock.fetch(&get("https://app.example/data.json")).await })
        };
        gate.notify_one();

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.body, Bytes::from("v2"));
    }
}
