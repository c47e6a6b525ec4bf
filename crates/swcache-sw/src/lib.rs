//! # swcache Service Worker
//!
//! Offline caching engine modelled on a web service worker.
//!
//! ## Features
//!
//! - **Versioned storage**: `{prefix}-static-{v}`, `{prefix}-app-{v}`, `{prefix}-font`
//! - **Strategies**: cache-first, network-first with offline fallback, stale-while-revalidate
//! - **Routing**: first-match classification of intercepted requests
//! - **Lifecycle**: install (precache), waiting, activate (prune + claim), redundant
//! - **Control channel**: `SKIP_WAITING`, `CLEAR_CACHE`, `CACHE_CLEARED`
//! - **Update coordination**: one reload per controller handover
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── Registration
//!     │       ├── installing (CacheWorker)
//!     │       ├── waiting (CacheWorker)
//!     │       └── active (CacheWorker)
//!     │               ├── StrategyRouter
//!     │               └── StrategyExecutor ──► dyn Fetcher
//!     │
//!     ├── Clients ──► UpdateCoordinator (per page)
//!     │
//!     └── CacheStoreManager
//!             └── dyn CacheBackend
//! ```

use swcache_common::SwCacheError;
use swcache_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod channel;
pub mod config;
pub mod container;
pub mod coordinator;
pub mod lifecycle;
pub mod router;
pub mod strategy;
pub mod worker;

pub use cache::{CacheHandle, CacheNames, CacheStoreManager, NamespaceKind, StoreError};
pub use channel::{ClientEvent, ClientId, Clients, ControlMessage};
pub use config::{EngineConfig, PrecacheRetry, RouteConfig};
pub use container::{RegistrationInfo, ServiceWorkerContainer};
pub use coordinator::{CoordinatorAction, PageReloader, UpdateCoordinator};
pub use lifecycle::{LifecycleEvent, WorkerState};
pub use router::{ResourceClass, Route, StrategyRouter};
pub use strategy::{Strategy, StrategyExecutor};
pub use worker::{ActivateOutcome, CacheWorker, InstallOutcome, WorkerId, WorkerSignal};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Invalid transition from {from} on {event:?}")]
    InvalidTransition {
        from: WorkerState,
        event: LifecycleEvent,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] StoreError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error(transparent)]
    Config(#[from] SwCacheError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Not found: {0}")]
    NotFound(String),
}
