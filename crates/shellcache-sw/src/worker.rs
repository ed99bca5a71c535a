//! A single worker version: one config, one generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use shellcache_net::{Fetcher, NetError, Request};

use crate::config::{ResolvedConfig, WorkerConfig};
use crate::error::Result;
use crate::generation::{CacheName, GenerationRegistry, PurgeReport};
use crate::lifecycle::{self, InstallReport};
use crate::storage::CacheStorage;
use crate::strategy::{self, FetchContext, FetchOutcome};

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, nothing run yet.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed, waiting to activate.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed or replaced by a newer worker.
    Redundant,
}

/// One worker version.
///
/// Cloning is cheap and clones share the same storage and network.
#[derive(Clone)]
pub struct OfflineWorker {
    id: WorkerId,
    state: WorkerState,
    state_changed_at: Instant,
    context: FetchContext,
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("generation", self.generation())
            .finish_non_exhaustive()
    }
}

impl OfflineWorker {
    /// Validate `config` and bind it to a store and a network.
    pub fn new(
        config: &WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        let config = Arc::new(config.resolve()?);
        let registry = GenerationRegistry::new(storage, config.generation.clone());
        Ok(Self {
            id: WorkerId::new(),
            state: WorkerState::Parsed,
            state_changed_at: Instant::now(),
            context: FetchContext {
                config,
                registry,
                fetcher,
            },
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Time of last state change.
    pub fn state_changed_at(&self) -> Instant {
        self.state_changed_at
    }

    pub fn set_state(&mut self, state: WorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == WorkerState::Redundant
    }

    pub fn generation(&self) -> &CacheName {
        self.context.registry.current()
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.context.config
    }

    pub fn registry(&self) -> &GenerationRegistry {
        &self.context.registry
    }

    /// Run the install handler.
    pub async fn install(&self) -> Result<InstallReport> {
        lifecycle::install(
            &self.context.config,
            &self.context.registry,
            self.context.fetcher.as_ref(),
        )
        .await
    }

    /// Run the activate handler.
    pub async fn activate(&self) -> Result<PurgeReport> {
        lifecycle::activate(&self.context.registry).await
    }

    /// Answer a request from the page.
    pub async fn handle_fetch(&self, request: &Request) -> std::result::Result<FetchOutcome, NetError> {
        strategy::respond(&self.context, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::strategy::ResponseSource;
    use shellcache_net::mock::MockFetcher;
    use url::Url;

    fn worker(generation: &str, storage: Arc<MemoryStorage>, mock: Arc<MockFetcher>) -> OfflineWorker {
        let config = WorkerConfig::new(generation, Url::parse("https://app.example").unwrap())
            .with_manifest(["/", "/index.html"]);
        OfflineWorker::new(&config, storage, mock).unwrap()
    }

    #[test]
    fn test_worker_state_transitions() {
        let mut w = worker("v1", Arc::new(MemoryStorage::new()), Arc::new(MockFetcher::new()));
        assert_eq!(w.state(), WorkerState::Parsed);
        assert!(!w.is_active());

        w.set_state(WorkerState::Installing);
        assert_eq!(w.state(), WorkerState::Installing);

        w.set_state(WorkerState::Activated);
        assert!(w.is_active());

        w.set_state(WorkerState::Redundant);
        assert!(w.is_redundant());
    }

    #[test]
    fn test_worker_ids_are_unique() {
        let storage = Arc::new(MemoryStorage::new());
        let mock = Arc::new(MockFetcher::new());
        let a = worker("v1", storage.clone(), mock.clone());
        let b = worker("v1", storage, mock);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = WorkerConfig::new("", Url::parse("https://app.example").unwrap());
        let result = OfflineWorker::new(
            &config,
            Arc::new(MemoryStorage::new()),
            Arc::new(MockFetcher::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_install_then_serve_offline() {
        let storage = Arc::new(MemoryStorage::new());
        let mock = Arc::new(MockFetcher::new());
        mock.respond("https://app.example/", 200, "root").await;
        mock.respond("https://app.example/index.html", 200, "shell").await;

        let w = worker("v1", storage, mock.clone());
        assert!(w.install().await.unwrap().is_complete());
        w.activate().await.unwrap();

        mock.set_offline(true);
        let request = Request::navigate(Url::parse("https://app.example/quiz").unwrap());
        let outcome = w.handle_fetch(&request).await.unwrap();
        assert_eq!(outcome.source, ResponseSource::ShellFallback);
        assert_eq!(outcome.response.text().unwrap(), "shell");
    }
}
