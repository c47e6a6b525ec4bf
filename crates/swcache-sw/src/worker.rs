//! The caching worker: install, activate, fetch and message handlers for
//! one deployed version.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use swcache_common::{retry_with_backoff, RetryConfig};
use swcache_net::{Fetcher, NetError, Request, Response};
use tokio::sync::{watch, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheHandle, CacheNames, CacheStoreManager, NamespaceKind};
use crate::channel::{ClientEvent, Clients, ControlMessage};
use crate::config::EngineConfig;
use crate::lifecycle::{Lifecycle, LifecycleEvent, WorkerState};
use crate::router::StrategyRouter;
use crate::strategy::StrategyExecutor;
use crate::ServiceWorkerError;

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A request the worker makes of its host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Activate now instead of waiting for old clients to close.
    SkipWaiting,
}

/// Result of the install handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOutcome {
    pub precached: Vec<String>,
    pub failed: Vec<String>,
    pub signal: Option<WorkerSignal>,
}

/// Result of the activate handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateOutcome {
    /// Namespaces deleted because they belong to older versions.
    pub pruned: Vec<String>,
    /// Precache assets that failed at install and were stored now.
    pub recovered: Vec<String>,
    /// Clients that switched to this worker.
    pub claimed: usize,
}

/// Shared services a worker runs against.
#[derive(Clone)]
pub struct WorkerContext {
    pub origin: Url,
    pub store: CacheStoreManager,
    pub fetcher: Arc<dyn Fetcher>,
    pub clients: Arc<Clients>,
    pub tasks: TaskTracker,
}

/// One version of the caching worker.
pub struct CacheWorker {
    id: WorkerId,
    script_url: Url,
    scope: Url,
    config: EngineConfig,
    names: CacheNames,
    lifecycle: Lifecycle,
    router: StrategyRouter,
    executor: StrategyExecutor,
    ctx: WorkerContext,
    retry: RetryConfig,
    failed_precache: Mutex<Vec<String>>,
}

impl CacheWorker {
    pub fn new(config: EngineConfig, ctx: WorkerContext) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let script_url = ctx.origin.join(&config.script_url)?;
        let scope = ctx.origin.join(&config.scope)?;

        Ok(Self {
            id: WorkerId::new(),
            script_url,
            scope,
            names: config.cache_names(),
            lifecycle: Lifecycle::new(),
            router: StrategyRouter::new(ctx.origin.clone(), &config),
            executor: StrategyExecutor::new(
                ctx.store.clone(),
                Arc::clone(&ctx.fetcher),
                ctx.tasks.clone(),
            ),
            retry: config.precache_retry.to_retry_config(),
            failed_precache: Mutex::new(Vec::new()),
            config,
            ctx,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn version(&self) -> &str {
        self.names.version()
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn names(&self) -> &CacheNames {
        &self.names
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.lifecycle.subscribe()
    }

    /// Apply a lifecycle event and announce the new state to every client.
    pub(crate) async fn transition(
        &self,
        event: LifecycleEvent,
    ) -> Result<WorkerState, ServiceWorkerError> {
        let state = self.lifecycle.apply(event)?;
        self.ctx
            .clients
            .broadcast(ClientEvent::StateChange {
                worker: self.id,
                state,
            })
            .await;
        Ok(state)
    }

    // ==================== Install ====================

    /// Run the install handler: open the app namespace and precache the
    /// manifest. Individual asset failures never fail the install.
    pub async fn install(&self) -> Result<InstallOutcome, ServiceWorkerError> {
        if self.state() != WorkerState::Installing {
            return Err(ServiceWorkerError::InvalidTransition {
                from: self.state(),
                event: LifecycleEvent::InstallCompleted,
            });
        }

        let handle = match self.ctx.store.open(&self.names.app.name).await {
            Ok(handle) => handle,
            Err(e) => {
                self.transition(LifecycleEvent::InstallFailed).await?;
                return Err(e.into());
            }
        };

        let (precached, failed) = self.precache(&handle, &self.config.precache).await;
        if !failed.is_empty() {
            warn!(version = self.version(), ?failed, "Precache incomplete");
        }
        *self.failed_precache.lock().await = failed.clone();

        self.transition(LifecycleEvent::InstallCompleted).await?;
        info!(
            version = self.version(),
            precached = precached.len(),
            failed = failed.len(),
            "Worker installed"
        );

        Ok(InstallOutcome {
            precached,
            failed,
            signal: self
                .config
                .skip_waiting_on_install
                .then_some(WorkerSignal::SkipWaiting),
        })
    }

    /// Fetch and store each path. Returns `(stored, failed)`.
    async fn precache(&self, handle: &CacheHandle, paths: &[String]) -> (Vec<String>, Vec<String>) {
        let results = futures::future::join_all(
            paths
                .iter()
                .map(|path| async move { (path, self.precache_one(handle, path).await) }),
        )
        .await;

        let mut stored = Vec::new();
        let mut failed = Vec::new();
        for (path, result) in results {
            match result {
                Ok(()) => stored.push(path.clone()),
                Err(e) => {
                    debug!(%path, error = %e, "Precache asset failed");
                    failed.push(path.clone());
                }
            }
        }
        (stored, failed)
    }

    async fn precache_one(&self, handle: &CacheHandle, path: &str) -> Result<(), ServiceWorkerError> {
        let request = Request::get(self.ctx.origin.join(path)?);
        let fetcher = &self.ctx.fetcher;
        let req = &request;

        let response = retry_with_backoff(&self.retry, || async move {
            let response = fetcher.fetch(req).await?;
            if response.ok() {
                Ok(response)
            } else {
                Err(NetError::RequestFailed(format!("status {}", response.status)))
            }
        })
        .await?;

        self.ctx.store.put(handle, &request, &response).await?;
        Ok(())
    }

    // ==================== Activate ====================

    /// Run the activate handler. `trigger` is what let this worker leave
    /// the waiting state.
    pub async fn activate(
        &self,
        trigger: LifecycleEvent,
    ) -> Result<ActivateOutcome, ServiceWorkerError> {
        self.transition(trigger).await?;
        if self.state() != WorkerState::Activating {
            return Err(ServiceWorkerError::InvalidTransition {
                from: self.state(),
                event: trigger,
            });
        }

        let pruned = match self
            .ctx
            .store
            .prune(self.names.prefix(), &self.names.current_keep_set())
            .await
        {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!(error = %e, "Failed to prune old namespaces");
                Vec::new()
            }
        };

        for kind in [NamespaceKind::Static, NamespaceKind::App, NamespaceKind::Font] {
            let name = &self.names.get(kind).name;
            if let Err(e) = self.ctx.store.open(name).await {
                warn!(namespace = %name, error = %e, "Failed to open namespace");
            }
        }

        let recovered = self.retry_failed_precache().await;
        let claimed = self.ctx.clients.claim(self.id, &self.scope).await;

        self.transition(LifecycleEvent::ActivateCompleted).await?;
        info!(
            version = self.version(),
            pruned = pruned.len(),
            recovered = recovered.len(),
            claimed,
            "Worker activated"
        );

        Ok(ActivateOutcome {
            pruned,
            recovered,
            claimed,
        })
    }

    async fn retry_failed_precache(&self) -> Vec<String> {
        let pending = std::mem::take(&mut *self.failed_precache.lock().await);
        if pending.is_empty() {
            return pending;
        }

        let handle = match self.ctx.store.open(&self.names.app.name).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Cannot reopen app namespace for precache retry");
                return Vec::new();
            }
        };

        let (recovered, still_failed) = self.precache(&handle, &pending).await;
        if !still_failed.is_empty() {
            warn!(failed = ?still_failed, "Precache still incomplete after activation");
        }
        recovered
    }

    /// Mark this worker as replaced by a newer version.
    pub(crate) async fn supersede(&self) {
        if let Err(e) = self.transition(LifecycleEvent::Superseded).await {
            debug!(worker = ?self.id, error = %e, "Worker not superseded");
        }
    }

    // ==================== Fetch ====================

    /// Handle an intercepted request. `None` means the request is not
    /// intercepted and should go to the network untouched.
    pub async fn handle_fetch(&self, request: &Request) -> Option<Response> {
        if self.state() != WorkerState::Activated {
            return None;
        }

        let route = self.router.route(request)?;
        debug!(
            url = %request.url,
            class = ?route.class,
            strategy = route.strategy.name(),
            namespace = %route.namespace,
            "Routing request"
        );
        Some(
            self.executor
                .execute(&route.strategy, request, &route.namespace)
                .await,
        )
    }

    // ==================== Message ====================

    /// Handle a posted message. Unknown messages are ignored.
    pub async fn handle_message(&self, data: &JsonValue) -> Option<WorkerSignal> {
        match ControlMessage::from_json(data)? {
            ControlMessage::SkipWaiting => Some(WorkerSignal::SkipWaiting),
            ControlMessage::ClearCache => {
                self.clear_cache().await;
                None
            }
            ControlMessage::CacheCleared => None,
        }
    }

    /// Drop every engine namespace except fonts, then tell every client.
    pub async fn clear_cache(&self) -> Vec<String> {
        let cleared = match self
            .ctx
            .store
            .prune(self.names.prefix(), &self.names.font_keep_set())
            .await
        {
            Ok(cleared) => cleared,
            Err(e) => {
                warn!(error = %e, "ClearCache failed");
                Vec::new()
            }
        };

        let clients = &self.ctx.clients;
        let mut notified = 0;
        for client in clients.match_all().await {
            if clients
                .post(client, ClientEvent::Message(ControlMessage::CacheCleared))
                .await
            {
                notified += 1;
            }
        }
        info!(cleared = cleared.len(), notified, "Cache cleared");
        cleared
    }
}

impl std::fmt::Debug for CacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWorker")
            .field("id", &self.id)
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swcache_net::MockFetcher;

    struct Harness {
        worker: CacheWorker,
        fetcher: Arc<MockFetcher>,
        store: CacheStoreManager,
        clients: Arc<Clients>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let fetcher = Arc::new(MockFetcher::new());
        let store = CacheStoreManager::in_memory();
        let clients = Arc::new(Clients::new());
        let ctx = WorkerContext {
            origin: Url::parse("https://app.test/").unwrap(),
            store: store.clone(),
            fetcher: fetcher.clone(),
            clients: Arc::clone(&clients),
            tasks: TaskTracker::new(),
        };
        Harness {
            worker: CacheWorker::new(config, ctx).unwrap(),
            fetcher,
            store,
            clients,
        }
    }

    fn serve_manifest(fetcher: &MockFetcher) {
        for path in EngineConfig::default().precache {
            fetcher.ok(&path, format!("asset {path}"));
        }
    }

    fn fast_retry() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.precache_retry.initial_delay_ms = 1;
        config
    }

    #[tokio::test]
    async fn test_install_precaches_manifest() {
        let h = harness(fast_retry());
        serve_manifest(&h.fetcher);

        let outcome = h.worker.install().await.unwrap();
        assert_eq!(outcome.precached.len(), 5);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.signal, None);
        assert_eq!(h.worker.state(), WorkerState::Waiting);
        assert_eq!(h.store.list_names().await.unwrap(), vec!["octopus-app-v1"]);
    }

    #[tokio::test]
    async fn test_install_survives_precache_failures() {
        let h = harness(fast_retry());
        h.fetcher.ok("/", "<html/>");
        h.fetcher.fail("/manifest.json");

        let outcome = h.worker.install().await.unwrap();
        assert_eq!(outcome.precached, vec!["/"]);
        assert_eq!(outcome.failed.len(), 4);
        assert_eq!(h.worker.state(), WorkerState::Waiting);
        // Each failing asset was attempted max_attempts times.
        assert_eq!(h.fetcher.calls_for("/manifest.json"), 2);
    }

    #[tokio::test]
    async fn test_install_twice_is_rejected() {
        let h = harness(fast_retry());
        h.worker.install().await.unwrap();
        assert!(h.worker.install().await.is_err());
    }

    #[tokio::test]
    async fn test_skip_waiting_on_install() {
        let config = EngineConfig {
            skip_waiting_on_install: true,
            ..fast_retry()
        };
        let h = harness(config);
        let outcome = h.worker.install().await.unwrap();
        assert_eq!(outcome.signal, Some(WorkerSignal::SkipWaiting));
    }

    #[tokio::test]
    async fn test_activate_prunes_and_retries_precache() {
        let h = harness(fast_retry());
        for stale in ["octopus-static-v0", "octopus-app-v0", "octopus-font", "foreign"] {
            h.store.open(stale).await.unwrap();
        }
        h.fetcher.set_online(false);
        h.worker.install().await.unwrap();

        h.fetcher.set_online(true);
        serve_manifest(&h.fetcher);
        let outcome = h.worker.activate(LifecycleEvent::NoPriorController).await.unwrap();

        assert_eq!(outcome.pruned, vec!["octopus-app-v0", "octopus-static-v0"]);
        assert_eq!(outcome.recovered.len(), 5);
        assert_eq!(h.worker.state(), WorkerState::Activated);
        assert_eq!(
            h.store.list_names().await.unwrap(),
            vec!["foreign", "octopus-app-v1", "octopus-font", "octopus-static-v1"]
        );
    }

    #[tokio::test]
    async fn test_activate_claims_clients() {
        let h = harness(fast_retry());
        let (client, mut rx) = h
            .clients
            .connect(Url::parse("https://app.test/dashboard").unwrap(), None)
            .await;

        h.worker.install().await.unwrap();
        let outcome = h.worker.activate(LifecycleEvent::NoPriorController).await.unwrap();
        assert_eq!(outcome.claimed, 1);
        assert_eq!(h.clients.controller_of(client).await, Some(h.worker.id()));

        let mut saw_controller_change = false;
        while let Ok(event) = rx.try_recv() {
            if let ClientEvent::ControllerChange { worker, previous } = event {
                assert_eq!(worker, h.worker.id());
                assert_eq!(previous, None);
                saw_controller_change = true;
            }
        }
        assert!(saw_controller_change);
    }

    #[tokio::test]
    async fn test_activate_requires_waiting() {
        let h = harness(fast_retry());
        assert!(h.worker.activate(LifecycleEvent::SkipWaiting).await.is_err());
        assert_eq!(h.worker.state(), WorkerState::Installing);
    }

    #[tokio::test]
    async fn test_fetch_only_when_activated() {
        let h = harness(fast_retry());
        h.fetcher.ok("/logo.svg", "<svg/>");
        let request = Request::parse("https://app.test/logo.svg").unwrap();

        assert!(h.worker.handle_fetch(&request).await.is_none());

        h.worker.install().await.unwrap();
        h.worker.activate(LifecycleEvent::NoPriorController).await.unwrap();
        let response = h.worker.handle_fetch(&request).await.unwrap();
        assert_eq!(response.text(), "<svg/>");
    }

    #[tokio::test]
    async fn test_messages() {
        let h = harness(fast_retry());
        let (_client, mut rx) = h
            .clients
            .connect(Url::parse("https://app.test/").unwrap(), None)
            .await;
        h.store.open("octopus-app-v1").await.unwrap();
        h.store.open("octopus-font").await.unwrap();

        assert_eq!(
            h.worker.handle_message(&json!({"type": "SKIP_WAITING"})).await,
            Some(WorkerSignal::SkipWaiting)
        );
        assert_eq!(h.worker.handle_message(&json!({"type": "NOPE"})).await, None);
        assert_eq!(h.worker.handle_message(&json!({"type": "CACHE_CLEARED"})).await, None);

        assert_eq!(h.worker.handle_message(&json!({"type": "CLEAR_CACHE"})).await, None);
        assert_eq!(h.store.list_names().await.unwrap(), vec!["octopus-font"]);
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::Message(ControlMessage::CacheCleared)
        );
    }
}
