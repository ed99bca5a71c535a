//! Worker registration: version slots, skip-waiting activation, clients.
//!
//! ```text
//! Registration
//!     ├── installing (OfflineWorker)
//!     ├── waiting    (OfflineWorker)
//!     ├── active     (OfflineWorker)  ── controls ──> Clients
//!     └── events ──> mpsc::UnboundedReceiver<RegistrationEvent>
//! ```
//!
//! A new version installs beside the active one. If install fails the new
//! worker becomes redundant and the old one keeps serving. If it succeeds the
//! new worker skips waiting: it takes the active slot, purges every other
//! generation and claims all clients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use shellcache_net::{Fetcher, NetError, Request};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{error, info, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::error::{CacheError, Result};
use crate::generation::CacheName;
use crate::lifecycle::InstallReport;
use crate::storage::CacheStorage;
use crate::strategy::{self, FetchOutcome};
use crate::worker::{OfflineWorker, WorkerId, WorkerState};

// ==================== Clients ====================

/// Unique identifier for a client (an open page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An open page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// Worker whose fetch policy applies to this page.
    pub controller: Option<WorkerId>,
}

/// Open pages known to the registration.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a page, optionally already controlled.
    pub fn add(&mut self, url: Url, controller: Option<WorkerId>) -> ClientId {
        let id = ClientId::new();
        self.clients.insert(
            id,
            Client {
                id,
                url,
                controller,
            },
        );
        id
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Make `worker` the controller of every page. Returns how many changed.
    pub fn claim(&mut self, worker: WorkerId) -> usize {
        let mut changed = 0;
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                changed += 1;
            }
        }
        changed
    }

    /// Pages controlled by `worker`.
    pub fn controlled_by(&self, worker: WorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ==================== Events ====================

/// Registration events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A worker changed state.
    StateChange {
        worker_id: WorkerId,
        generation: CacheName,
        new_state: WorkerState,
    },
    /// Stale generations were removed during activation.
    GenerationsPurged {
        current: CacheName,
        deleted: Vec<String>,
        failed: Vec<String>,
    },
    /// A worker took control of the open pages.
    ControllerChange {
        worker_id: WorkerId,
        generation: CacheName,
        clients: usize,
    },
}

// ==================== Registration ====================

#[derive(Debug, Default)]
struct Slots {
    installing: Option<OfflineWorker>,
    waiting: Option<OfflineWorker>,
    active: Option<OfflineWorker>,
}

/// The registration that owns every worker version for one application.
pub struct Registration {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    slots: RwLock<Slots>,
    clients: RwLock<Clients>,
    // One update at a time.
    update_lock: Mutex<()>,
    event_tx: mpsc::UnboundedSender<RegistrationEvent>,
}

impl Registration {
    /// Create a registration over a store and a network.
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                storage,
                fetcher,
                slots: RwLock::new(Slots::default()),
                clients: RwLock::new(Clients::new()),
                update_lock: Mutex::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: RegistrationEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: &OfflineWorker) {
        self.emit(RegistrationEvent::StateChange {
            worker_id: worker.id(),
            generation: worker.generation().clone(),
            new_state: worker.state(),
        });
    }

    /// Install a new worker version and, on success, activate it at once.
    ///
    /// On install failure the error is returned, the new worker is redundant
    /// and the previously active worker stays in control.
    pub async fn register(&self, config: &WorkerConfig) -> Result<InstallReport> {
        let _update = self.update_lock.lock().await;

        let mut worker = OfflineWorker::new(config, self.storage.clone(), self.fetcher.clone())?;
        worker.set_state(WorkerState::Installing);
        self.emit_state(&worker);
        self.slots.write().await.installing = Some(worker.clone());

        let report = match worker.install().await {
            Ok(report) => report,
            Err(e) => {
                worker.set_state(WorkerState::Redundant);
                self.slots.write().await.installing = None;
                self.emit_state(&worker);
                error!(
                    worker = worker.id().raw(),
                    generation = %worker.generation(),
                    error = %e,
                    "Install failed, previous worker stays in control"
                );
                return Err(e);
            }
        };

        worker.set_state(WorkerState::Installed);
        {
            let mut slots = self.slots.write().await;
            slots.installing = None;
            slots.waiting = Some(worker.clone());
        }
        self.emit_state(&worker);

        self.activate_waiting().await?;
        Ok(report)
    }

    /// Promote the waiting worker (skip waiting).
    async fn activate_waiting(&self) -> Result<()> {
        let (worker, previous) = {
            let mut slots = self.slots.write().await;
            let mut worker = slots
                .waiting
                .take()
                .ok_or_else(|| CacheError::State("no waiting worker".to_string()))?;
            worker.set_state(WorkerState::Activating);
            let previous = slots.active.replace(worker.clone());
            (worker, previous)
        };
        self.emit_state(&worker);

        if let Some(mut old) = previous {
            old.set_state(WorkerState::Redundant);
            self.emit_state(&old);
        }

        match worker.activate().await {
            Ok(purge) => self.emit(RegistrationEvent::GenerationsPurged {
                current: worker.generation().clone(),
                deleted: purge.deleted,
                failed: purge.failed.into_iter().map(|(name, _)| name).collect(),
            }),
            Err(e) => error!(
                generation = %worker.generation(),
                error = %e,
                "Could not enumerate cache generations; stale ones may remain"
            ),
        }

        let activated = {
            let mut slots = self.slots.write().await;
            match slots.active.as_mut() {
                Some(active) if active.id() == worker.id() => {
                    active.set_state(WorkerState::Activated);
                    active.clone()
                }
                _ => {
                    return Err(CacheError::State(format!(
                        "worker {} lost the active slot during activation",
                        worker.id().raw()
                    )))
                }
            }
        };
        self.emit_state(&activated);

        let clients = self.clients.write().await.claim(activated.id());
        info!(
            worker = activated.id().raw(),
            generation = %activated.generation(),
            clients,
            "Worker active and controlling"
        );
        self.emit(RegistrationEvent::ControllerChange {
            worker_id: activated.id(),
            generation: activated.generation().clone(),
            clients,
        });
        Ok(())
    }

    /// Answer a page request through the active worker.
    ///
    /// With no active worker the request goes to the network unchanged.
    pub async fn handle_fetch(&self, request: &Request) -> std::result::Result<FetchOutcome, NetError> {
        let active = self.slots.read().await.active.clone();
        match active {
            Some(worker) => worker.handle_fetch(request).await,
            None => {
                warn!(url = %request.url, "No active worker, passing through");
                strategy::pass_through(self.fetcher.as_ref(), request).await
            }
        }
    }

    /// Generation of the active worker.
    pub async fn active_generation(&self) -> Option<CacheName> {
        self.slots
            .read()
            .await
            .active
            .as_ref()
            .map(|w| w.generation().clone())
    }

    /// Id and state of the active worker.
    pub async fn active_worker(&self) -> Option<(WorkerId, WorkerState)> {
        self.slots
            .read()
            .await
            .active
            .as_ref()
            .map(|w| (w.id(), w.state()))
    }

    /// True while a new version is installing or waiting.
    pub async fn has_pending_worker(&self) -> bool {
        let slots = self.slots.read().await;
        slots.installing.is_some() || slots.waiting.is_some()
    }

    /// Open a page. It is controlled by the active worker, if any.
    pub async fn add_client(&self, url: Url) -> ClientId {
        let controller = self.active_worker().await.map(|(id, _)| id);
        self.clients.write().await.add(url, controller)
    }

    /// Close a page.
    pub async fn remove_client(&self, id: ClientId) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Look up a page.
    pub async fn client(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    /// Pages controlled by `worker`.
    pub async fn controlled_by(&self, worker: WorkerId) -> usize {
        self.clients.read().await.controlled_by(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use shellcache_net::mock::MockFetcher;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_clients_claim() {
        let mut clients = Clients::new();
        let a = clients.add(url("https://app.example/"), None);
        clients.add(url("https://app.example/quiz"), None);
        assert_eq!(clients.len(), 2);

        let worker = WorkerId::new();
        assert_eq!(clients.claim(worker), 2);
        assert_eq!(clients.claim(worker), 0);
        assert_eq!(clients.controlled_by(worker), 2);

        assert!(clients.remove(a).is_some());
        assert!(clients.get(a).is_none());
        assert!(!clients.is_empty());
    }

    #[tokio::test]
    async fn test_register_emits_lifecycle_events() {
        let mock = Arc::new(MockFetcher::new());
        mock.respond("https://app.example/index.html", 200, "shell").await;
        let (registration, mut events) =
            Registration::new(Arc::new(MemoryStorage::new()), mock);

        let config = WorkerConfig::new("v1", url("https://app.example"))
            .with_manifest(["/index.html"]);
        registration.register(&config).await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RegistrationEvent::StateChange { new_state, .. } = event {
                states.push(new_state);
            }
        }
        assert_eq!(
            states,
            vec![
                WorkerState::Installing,
                WorkerState::Installed,
                WorkerState::Activating,
                WorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_without_active_worker_passes_through() {
        let mock = Arc::new(MockFetcher::new());
        mock.respond("https://app.example/", 200, "home").await;
        let (registration, _events) =
            Registration::new(Arc::new(MemoryStorage::new()), mock.clone());

        let outcome = registration
            .handle_fetch(&Request::navigate(url("https://app.example/")))
            .await
            .unwrap();
        assert_eq!(outcome.strategy, crate::policy::Strategy::PassThrough);
        assert!(registration.active_generation().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_no_worker() {
        let (registration, _events) = Registration::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MockFetcher::new()),
        );
        let config = WorkerConfig::new(" ", url("https://app.example"));
        assert!(registration.register(&config).await.is_err());
        assert!(!registration.has_pending_worker().await);
        assert!(registration.active_worker().await.is_none());
    }
}
