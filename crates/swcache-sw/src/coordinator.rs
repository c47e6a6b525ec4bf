//! Page-side update coordinator.
//!
//! Registers the worker for a page, pushes a freshly installed version past
//! the waiting state, and reloads the page once when control is handed over
//! from an older version. The first install of a page never reloads it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ClientEvent, ClientId, ControlMessage};
use crate::config::EngineConfig;
use crate::container::ServiceWorkerContainer;
use crate::lifecycle::WorkerState;
use crate::worker::WorkerId;

/// Reloads the page hosting a client.
pub trait PageReloader: Send + Sync {
    fn reload(&self);
}

/// What the coordinator did in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorAction {
    None,
    SkipWaitingSent(WorkerId),
    Reloaded,
}

pub struct UpdateCoordinator {
    container: ServiceWorkerContainer,
    client: ClientId,
    config: EngineConfig,
    reloader: Arc<dyn PageReloader>,
    watching: Option<WorkerId>,
    reloaded: bool,
}

impl UpdateCoordinator {
    pub fn new(
        container: ServiceWorkerContainer,
        client: ClientId,
        config: EngineConfig,
        reloader: Arc<dyn PageReloader>,
    ) -> Self {
        Self {
            container,
            client,
            config,
            reloader,
            watching: None,
            reloaded: false,
        }
    }

    pub fn has_reloaded(&self) -> bool {
        self.reloaded
    }

    /// Register the configured worker. Registration errors are logged and
    /// leave the page uncontrolled.
    pub async fn register(&mut self) -> CoordinatorAction {
        let info = match self.container.register(self.config.clone()).await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Worker registration failed");
                return CoordinatorAction::None;
            }
        };

        if let Some(installing) = info.installing {
            self.watching = Some(installing);
        }
        match info.waiting {
            Some(waiting) => self.promote(waiting).await,
            None => CoordinatorAction::None,
        }
    }

    /// React to one client event.
    pub async fn handle_event(&mut self, event: ClientEvent) -> CoordinatorAction {
        match event {
            ClientEvent::UpdateFound { worker } => {
                debug!(?worker, "Update found");
                self.watching = Some(worker);
                CoordinatorAction::None
            }
            ClientEvent::StateChange {
                worker,
                state: WorkerState::Waiting,
            } if self.watching == Some(worker) => self.promote(worker).await,
            ClientEvent::ControllerChange {
                worker,
                previous: Some(previous),
            } => {
                if self.reloaded {
                    return CoordinatorAction::None;
                }
                self.reloaded = true;
                info!(?previous, ?worker, "Controller changed, reloading");
                self.reloader.reload();
                CoordinatorAction::Reloaded
            }
            _ => CoordinatorAction::None,
        }
    }

    /// Handle every event already queued on `events`.
    pub async fn pump(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Vec<CoordinatorAction> {
        let mut actions = Vec::new();
        while let Ok(event) = events.try_recv() {
            let action = self.handle_event(event).await;
            if action != CoordinatorAction::None {
                actions.push(action);
            }
        }
        actions
    }

    /// Handle events until the channel closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
    }

    /// Ask a waiting worker to activate, but only when an older worker
    /// controls this page.
    async fn promote(&mut self, waiting: WorkerId) -> CoordinatorAction {
        let controller = self.container.clients().controller_of(self.client).await;
        match controller {
            Some(controller) if controller != waiting => {
                debug!(?waiting, ?controller, "Sending SKIP_WAITING");
                self.container.send(waiting, ControlMessage::SkipWaiting);
                CoordinatorAction::SkipWaitingSent(waiting)
            }
            _ => CoordinatorAction::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use swcache_net::MockFetcher;
    use url::Url;

    #[derive(Default)]
    struct CountingReloader(AtomicUsize);

    impl PageReloader for CountingReloader {
        fn reload(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn version(v: &str) -> EngineConfig {
        let mut config = EngineConfig {
            cache_version: v.to_string(),
            ..EngineConfig::default()
        };
        config.precache_retry.initial_delay_ms = 1;
        config
    }

    async fn page(
        container: &ServiceWorkerContainer,
        config: EngineConfig,
    ) -> (
        UpdateCoordinator,
        mpsc::UnboundedReceiver<ClientEvent>,
        Arc<CountingReloader>,
    ) {
        let (client, rx) = container
            .connect_client(Url::parse("https://app.test/").unwrap())
            .await;
        let reloader = Arc::new(CountingReloader::default());
        let coordinator = UpdateCoordinator::new(container.clone(), client, config, reloader.clone());
        (coordinator, rx, reloader)
    }

    fn container() -> ServiceWorkerContainer {
        ServiceWorkerContainer::in_memory(
            Url::parse("https://app.test/").unwrap(),
            Arc::new(MockFetcher::new()),
        )
    }

    #[tokio::test]
    async fn test_first_install_does_not_reload() {
        let container = container();
        let (mut coordinator, mut rx, reloader) = page(&container, version("v1")).await;

        coordinator.register().await;
        container.settle().await;
        let actions = coordinator.pump(&mut rx).await;

        assert!(actions.is_empty());
        assert_eq!(reloader.0.load(Ordering::SeqCst), 0);
        assert!(container.active_worker().await.is_some());
    }

    #[tokio::test]
    async fn test_update_reloads_once() {
        let container = container();
        let (mut coordinator, mut rx, reloader) = page(&container, version("v1")).await;
        coordinator.register().await;
        container.settle().await;
        coordinator.pump(&mut rx).await;

        container.register(version("v2")).await.unwrap();
        container.settle().await;
        let actions = coordinator.pump(&mut rx).await;
        assert!(matches!(actions.as_slice(), [CoordinatorAction::SkipWaitingSent(_)]));

        container.settle().await;
        let actions = coordinator.pump(&mut rx).await;
        assert_eq!(actions, vec![CoordinatorAction::Reloaded]);
        assert_eq!(reloader.0.load(Ordering::SeqCst), 1);

        // A later handover on the same page does not reload again.
        let action = coordinator
            .handle_event(ClientEvent::ControllerChange {
                worker: WorkerId::from_raw(999),
                previous: Some(WorkerId::from_raw(998)),
            })
            .await;
        assert_eq!(action, CoordinatorAction::None);
        assert_eq!(reloader.0.load(Ordering::SeqCst), 1);
        assert!(coordinator.has_reloaded());
    }

    #[tokio::test]
    async fn test_registration_failure_is_swallowed() {
        let container = container();
        let config = EngineConfig {
            cache_prefix: String::new(),
            ..EngineConfig::default()
        };
        let (mut coordinator, _rx, _) = page(&container, config).await;
        assert_eq!(coordinator.register().await, CoordinatorAction::None);
        assert_eq!(container.registration().await.installing, None);
    }
}
