//! Service worker container.
//!
//! Owns the registration (installing / waiting / active slots), the client
//! registry, and the background task tracker. Workers are installed and
//! activated on the tracker so `register` returns as soon as the new
//! version is queued.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use swcache_net::{Fetcher, NetError, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStoreManager;
use crate::channel::{ClientEvent, ClientId, Clients, ControlMessage};
use crate::config::EngineConfig;
use crate::lifecycle::{LifecycleEvent, WorkerState};
use crate::worker::{CacheWorker, WorkerContext, WorkerId, WorkerSignal};
use crate::ServiceWorkerError;

#[derive(Debug, Default)]
struct Registration {
    scope: Option<Url>,
    installing: Option<Arc<CacheWorker>>,
    waiting: Option<Arc<CacheWorker>>,
    active: Option<Arc<CacheWorker>>,
}

impl Registration {
    /// The most recently registered worker still in a slot.
    fn newest(&self) -> Option<&Arc<CacheWorker>> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
    }

    fn find(&self, id: WorkerId) -> Option<&Arc<CacheWorker>> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id() == id)
    }

    fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            scope: self.scope.clone(),
            installing: self.installing.as_ref().map(|w| w.id()),
            waiting: self.waiting.as_ref().map(|w| w.id()),
            active: self.active.as_ref().map(|w| w.id()),
        }
    }
}

/// Snapshot of the registration slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub scope: Option<Url>,
    pub installing: Option<WorkerId>,
    pub waiting: Option<WorkerId>,
    pub active: Option<WorkerId>,
}

/// Host for the caching worker of one origin.
#[derive(Clone)]
pub struct ServiceWorkerContainer {
    origin: Url,
    registration: Arc<RwLock<Registration>>,
    clients: Arc<Clients>,
    store: CacheStoreManager,
    fetcher: Arc<dyn Fetcher>,
    tasks: TaskTracker,
}

impl ServiceWorkerContainer {
    pub fn new(origin: Url, store: CacheStoreManager, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            origin,
            registration: Arc::new(RwLock::new(Registration::default())),
            clients: Arc::new(Clients::new()),
            store,
            fetcher,
            tasks: TaskTracker::new(),
        }
    }

    /// Container backed by in-memory storage.
    pub fn in_memory(origin: Url, fetcher: Arc<dyn Fetcher>) -> Self {
        Self::new(origin, CacheStoreManager::in_memory(), fetcher)
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn store(&self) -> &CacheStoreManager {
        &self.store
    }

    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    // ==================== Registration ====================

    /// Register a worker version.
    ///
    /// Registering the version and script that is already the newest is a
    /// no-op. Otherwise a new worker is queued for install and every client
    /// receives [`ClientEvent::UpdateFound`].
    pub async fn register(
        &self,
        config: EngineConfig,
    ) -> Result<RegistrationInfo, ServiceWorkerError> {
        config.validate()?;
        let script_url = self.origin.join(&config.script_url)?;
        let scope = self.origin.join(&config.scope)?;

        if script_url.origin() != self.origin.origin() {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "script {script_url} is not same-origin with {}",
                self.origin
            )));
        }
        let script_dir = script_url
            .path()
            .rsplit_once('/')
            .map(|(dir, _)| format!("{dir}/"))
            .unwrap_or_else(|| "/".to_string());
        if !scope.path().starts_with(&script_dir) {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "scope {} is outside the script directory {script_dir}",
                scope.path()
            )));
        }

        let (worker, queued) = {
            let mut registration = self.registration.write().await;
            if let Some(newest) = registration.newest() {
                if newest.version() == config.cache_version && newest.script_url() == &script_url {
                    debug!(version = %config.cache_version, "Worker unchanged, skipping update");
                    return Ok(registration.info());
                }
            }

            let worker = Arc::new(CacheWorker::new(config, self.worker_context())?);
            info!(
                worker = ?worker.id(),
                version = worker.version(),
                script = %script_url,
                "Registering worker"
            );
            registration.scope = Some(scope);
            if let Some(previous) = registration.installing.replace(Arc::clone(&worker)) {
                debug!(worker = ?previous.id(), "Installing worker replaced");
            }
            (worker, registration.info())
        };

        self.clients
            .broadcast(ClientEvent::UpdateFound { worker: worker.id() })
            .await;

        let this = self.clone();
        self.tasks.spawn(async move { this.install_pipeline(worker).await });

        Ok(queued)
    }

    pub async fn registration(&self) -> RegistrationInfo {
        self.registration.read().await.info()
    }

    pub async fn worker(&self, id: WorkerId) -> Option<Arc<CacheWorker>> {
        self.registration.read().await.find(id).cloned()
    }

    pub async fn active_worker(&self) -> Option<Arc<CacheWorker>> {
        self.registration.read().await.active.clone()
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            origin: self.origin.clone(),
            store: self.store.clone(),
            fetcher: Arc::clone(&self.fetcher),
            clients: Arc::clone(&self.clients),
            tasks: self.tasks.clone(),
        }
    }

    async fn install_pipeline(&self, worker: Arc<CacheWorker>) {
        let outcome = match worker.install().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(worker = ?worker.id(), error = %e, "Install failed");
                if worker.state() == WorkerState::Installing {
                    let _ = worker.transition(LifecycleEvent::InstallFailed).await;
                }
                let mut registration = self.registration.write().await;
                if registration.installing.as_ref().map(|w| w.id()) == Some(worker.id()) {
                    registration.installing = None;
                }
                return;
            }
        };

        let has_active = {
            let mut registration = self.registration.write().await;
            if registration.installing.as_ref().map(|w| w.id()) != Some(worker.id()) {
                drop(registration);
                debug!(worker = ?worker.id(), "Installed worker was superseded");
                worker.supersede().await;
                return;
            }
            registration.installing = None;
            if let Some(previous) = registration.waiting.replace(Arc::clone(&worker)) {
                previous.supersede().await;
            }
            registration.active.is_some()
        };

        let trigger = if !has_active {
            Some(LifecycleEvent::NoPriorController)
        } else if outcome.signal == Some(WorkerSignal::SkipWaiting) {
            Some(LifecycleEvent::SkipWaiting)
        } else {
            None
        };

        if let Some(trigger) = trigger {
            if let Err(e) = self.activate_waiting(worker.id(), trigger).await {
                error!(worker = ?worker.id(), error = %e, "Activation failed");
            }
        }
    }

    /// Promote the waiting worker `id` to active. The previous active
    /// worker becomes redundant before the new one activates.
    pub(crate) async fn activate_waiting(
        &self,
        id: WorkerId,
        trigger: LifecycleEvent,
    ) -> Result<(), ServiceWorkerError> {
        let (worker, previous) = {
            let mut registration = self.registration.write().await;
            match registration.waiting.take() {
                Some(waiting) if waiting.id() == id => {
                    let previous = registration.active.replace(Arc::clone(&waiting));
                    (waiting, previous)
                }
                other => {
                    registration.waiting = other;
                    return Err(ServiceWorkerError::NotFound(format!(
                        "no waiting worker {id:?}"
                    )));
                }
            }
        };

        if let Some(previous) = previous {
            previous.supersede().await;
        }
        worker.activate(trigger).await?;
        Ok(())
    }

    // ==================== Clients ====================

    /// Open a page at `url`. It is controlled by the active worker if the
    /// URL is in scope.
    pub async fn connect_client(
        &self,
        url: Url,
    ) -> (ClientId, mpsc::UnboundedReceiver<ClientEvent>) {
        let controller = {
            let registration = self.registration.read().await;
            registration
                .active
                .as_ref()
                .filter(|w| url.as_str().starts_with(w.scope().as_str()))
                .map(|w| w.id())
        };
        self.clients.connect(url, controller).await
    }

    pub async fn disconnect_client(&self, id: ClientId) -> bool {
        self.clients.disconnect(id).await
    }

    /// Issue a request from `client`. Controlled clients go through the
    /// worker; everything else goes straight to the network.
    pub async fn fetch(&self, client: ClientId, request: &Request) -> Result<Response, NetError> {
        if let Some(worker) = self.fetch_handler(client).await {
            if let Some(response) = worker.handle_fetch(request).await {
                return Ok(response);
            }
        }
        self.fetcher.fetch(request).await
    }

    /// The worker that answers fetches from `client`.
    ///
    /// A controller that was replaced hands over to the active worker. Fetches
    /// are held while that worker is still running its activate handler.
    async fn fetch_handler(&self, client: ClientId) -> Option<Arc<CacheWorker>> {
        let controller = self.clients.controller_of(client).await?;
        let worker = match self.worker(controller).await {
            Some(worker) if worker.state() != WorkerState::Redundant => worker,
            _ => self.active_worker().await?,
        };

        if worker.state() == WorkerState::Activating {
            debug!(worker = ?worker.id(), "Holding fetch until activation completes");
            let mut state = worker.subscribe_state();
            let activated = state
                .wait_for(|state| *state != WorkerState::Activating)
                .await
                .is_ok();
            if !activated {
                return None;
            }
        }
        Some(worker)
    }

    // ==================== Messages ====================

    /// Post `data` to worker `id`. Delivery is fire-and-forget.
    pub fn post_message(&self, id: WorkerId, data: JsonValue) {
        let this = self.clone();
        self.tasks.spawn(async move {
            let Some(worker) = this.worker(id).await else {
                warn!(worker = ?id, "Message for unknown worker dropped");
                return;
            };
            if worker.handle_message(&data).await == Some(WorkerSignal::SkipWaiting) {
                if let Err(e) = this.activate_waiting(id, LifecycleEvent::SkipWaiting).await {
                    debug!(worker = ?id, error = %e, "SkipWaiting ignored");
                }
            }
        });
    }

    pub fn send(&self, id: WorkerId, message: ControlMessage) {
        self.post_message(id, message.to_json());
    }

    /// Wait for every background install, activation, message and
    /// revalidation to finish.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swcache_net::MockFetcher;

    fn setup() -> (ServiceWorkerContainer, Arc<MockFetcher>) {
        let fetcher = Arc::new(MockFetcher::new());
        let container =
            ServiceWorkerContainer::in_memory(Url::parse("https://app.test/").unwrap(), fetcher.clone());
        (container, fetcher)
    }

    fn version(v: &str) -> EngineConfig {
        let mut config = EngineConfig {
            cache_version: v.to_string(),
            ..EngineConfig::default()
        };
        config.precache_retry.initial_delay_ms = 1;
        config
    }

    #[tokio::test]
    async fn test_first_registration_activates() {
        let (container, _) = setup();
        let info = container.register(version("v1")).await.unwrap();
        assert!(info.installing.is_some());

        container.settle().await;
        let info = container.registration().await;
        assert!(info.active.is_some());
        assert!(info.installing.is_none() && info.waiting.is_none());
        let active = container.active_worker().await.unwrap();
        assert_eq!(active.state(), WorkerState::Activated);
        assert_eq!(info.scope.unwrap().as_str(), "https://app.test/");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registration_snapshot_shows_queued_worker() {
        let (container, _) = setup();
        for round in 0..20 {
            let config = EngineConfig {
                precache: Vec::new(),
                ..version(&format!("v{round}"))
            };
            let info = container.register(config).await.unwrap();
            let queued = info.installing.expect("new version is queued for install");
            assert_ne!(info.active, Some(queued));

            container.settle().await;
            let worker = container.worker(queued).await.unwrap();
            if round == 0 {
                assert_eq!(worker.state(), WorkerState::Activated);
            } else {
                assert_eq!(worker.state(), WorkerState::Waiting);
            }
        }
    }

    #[tokio::test]
    async fn test_reregistering_same_version_is_noop() {
        let (container, fetcher) = setup();
        container.register(version("v1")).await.unwrap();
        container.settle().await;
        let calls = fetcher.call_count();

        let info = container.register(version("v1")).await.unwrap();
        container.settle().await;
        assert!(info.installing.is_none());
        assert_eq!(fetcher.call_count(), calls);
    }

    #[tokio::test]
    async fn test_update_waits_until_skip_waiting() {
        let (container, _) = setup();
        container.register(version("v1")).await.unwrap();
        container.settle().await;
        let v1 = container.active_worker().await.unwrap();

        let info = container.register(version("v2")).await.unwrap();
        let v2 = info.installing.unwrap();
        container.settle().await;

        let info = container.registration().await;
        assert_eq!(info.waiting, Some(v2));
        assert_eq!(info.active, Some(v1.id()));

        container.send(v2, ControlMessage::SkipWaiting);
        container.settle().await;

        let info = container.registration().await;
        assert_eq!(info.active, Some(v2));
        assert_eq!(info.waiting, None);
        assert_eq!(v1.state(), WorkerState::Redundant);
    }

    #[tokio::test]
    async fn test_skip_waiting_to_active_worker_is_ignored() {
        let (container, _) = setup();
        container.register(version("v1")).await.unwrap();
        container.settle().await;
        let v1 = container.active_worker().await.unwrap();

        container.post_message(v1.id(), json!({"type": "SKIP_WAITING"}));
        container.settle().await;
        assert_eq!(v1.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_rejects_scope_outside_script_directory() {
        let (container, _) = setup();
        let config = EngineConfig {
            script_url: "/static/sw.js".to_string(),
            scope: "/".to_string(),
            ..EngineConfig::default()
        };
        assert!(matches!(
            container.register(config).await,
            Err(ServiceWorkerError::RegistrationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_cross_origin_script() {
        let (container, _) = setup();
        let config = EngineConfig {
            script_url: "https://cdn.test/sw.js".to_string(),
            ..EngineConfig::default()
        };
        assert!(container.register(config).await.is_err());
    }

    #[tokio::test]
    async fn test_uncontrolled_client_goes_to_network() {
        let (container, fetcher) = setup();
        fetcher.ok("/logo.svg", "<svg/>");
        let (client, _rx) = container
            .connect_client(Url::parse("https://app.test/").unwrap())
            .await;

        let request = Request::parse("https://app.test/logo.svg").unwrap();
        let response = container.fetch(client, &request).await.unwrap();
        assert_eq!(response.text(), "<svg/>");
        assert!(container.store().list_names().await.unwrap().is_empty());
    }
}
