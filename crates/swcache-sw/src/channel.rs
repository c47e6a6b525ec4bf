//! Control channel between foreground clients and the worker.
//!
//! Messages are JSON objects with a single `type` field. Delivery is
//! fire-and-forget; unknown types decode to `None` and are dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::Url;

use crate::lifecycle::WorkerState;
use crate::worker::WorkerId;

/// Control protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Client → waiting worker: activate now.
    SkipWaiting,
    /// Client → worker: drop every engine namespace except fonts.
    ClearCache,
    /// Worker → clients: a ClearCache finished.
    CacheCleared,
}

impl ControlMessage {
    pub fn to_json(&self) -> JsonValue {
        // Unit variants of an internally tagged enum always serialize.
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Decode a message. Unknown or malformed payloads yield `None`.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(payload = %value, error = %e, "Ignoring unknown control message");
                None
            }
        }
    }
}

/// Unique identifier for a client (an open page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Events delivered to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A new worker version started installing.
    UpdateFound { worker: WorkerId },
    /// A worker changed state.
    StateChange { worker: WorkerId, state: WorkerState },
    /// The client is now controlled by `worker`.
    ControllerChange {
        worker: WorkerId,
        previous: Option<WorkerId>,
    },
    /// A control message posted by the worker.
    Message(ControlMessage),
}

#[derive(Debug)]
struct Client {
    url: Url,
    controller: Option<WorkerId>,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

/// Registry of connected clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<ClientId, Client>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client at `url`, optionally already controlled.
    pub async fn connect(
        &self,
        url: Url,
        controller: Option<WorkerId>,
    ) -> (ClientId, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        debug!(?id, %url, ?controller, "Client connected");
        self.clients.write().await.insert(
            id,
            Client {
                url,
                controller,
                tx,
            },
        );
        (id, rx)
    }

    pub async fn disconnect(&self, id: ClientId) -> bool {
        self.clients.write().await.remove(&id).is_some()
    }

    pub async fn controller_of(&self, id: ClientId) -> Option<WorkerId> {
        self.clients.read().await.get(&id)?.controller
    }

    /// IDs of all connected clients.
    pub async fn match_all(&self) -> Vec<ClientId> {
        self.clients.read().await.keys().copied().collect()
    }

    /// Make `worker` the controller of every client under `scope`. Clients
    /// whose controller changed receive [`ClientEvent::ControllerChange`].
    ///
    /// Returns the number of clients that changed controller.
    pub async fn claim(&self, worker: WorkerId, scope: &Url) -> usize {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for (id, client) in clients.iter_mut() {
            if client.controller == Some(worker) || !in_scope(&client.url, scope) {
                continue;
            }
            let previous = client.controller.replace(worker);
            trace!(client = ?id, ?worker, ?previous, "Client claimed");
            let _ = client
                .tx
                .send(ClientEvent::ControllerChange { worker, previous });
            claimed += 1;
        }
        claimed
    }

    /// Send an event to one client. Returns false if it is gone.
    pub async fn post(&self, id: ClientId, event: ClientEvent) -> bool {
        match self.clients.read().await.get(&id) {
            Some(client) => client.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Send an event to every client. Returns how many received it.
    pub async fn broadcast(&self, event: ClientEvent) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|client| client.tx.send(event.clone()).is_ok())
            .count()
    }
}

fn in_scope(url: &Url, scope: &Url) -> bool {
    url.origin() == scope.origin() && url.path().starts_with(scope.path())
}
