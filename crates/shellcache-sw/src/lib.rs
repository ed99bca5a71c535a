//! # ShellCache Service Worker
//!
//! Offline asset cache for a single-page application.
//!
//! ## Features
//!
//! - **Generations**: one named store per deployment; activation deletes every
//!   other one
//! - **Precache**: the shell manifest is stored at install, one entry at a time
//! - **Fetch policy**: navigations are network-first with cache and shell
//!   fallback, sub-resources are stale-while-revalidate, everything else
//!   passes through
//! - **Storage**: in-memory (with optional quota) or a directory of JSON
//!   documents
//!
//! ## Architecture
//!
//! ```text
//! Registration
//!     └── OfflineWorker (one per deployed config)
//!             ├── ResolvedConfig (generation, manifest, shell, policy)
//!             ├── GenerationRegistry ── CacheStorage (MemoryStorage | DiskStorage)
//!             └── Fetcher (HttpFetcher | OfflineFetcher | MockFetcher)
//!
//! Request ── classify() ── Strategy ── respond() ── FetchOutcome
//! ```

pub mod config;
pub mod disk;
pub mod error;
pub mod generation;
pub mod lifecycle;
pub mod policy;
pub mod registration;
pub mod storage;
pub mod strategy;
pub mod worker;

pub use config::{CrossOriginCaching, ResolvedConfig, RetrySettings, WorkerConfig};
pub use disk::DiskStorage;
pub use error::{CacheError, Result};
pub use generation::{CacheName, GenerationRegistry, PurgeReport};
pub use lifecycle::{activate, install, InstallReport};
pub use policy::{classify, is_cacheable, Strategy};
pub use registration::{Client, ClientId, Clients, Registration, RegistrationEvent};
pub use storage::{CacheEntry, CacheStorage, MemoryStorage};
pub use strategy::{respond, FetchContext, FetchOutcome, ResponseSource};
pub use worker::{OfflineWorker, WorkerId, WorkerState};
