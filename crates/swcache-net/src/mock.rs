//! Scripted in-process network for headless tests and demos.
//!
//! Routes are keyed by URL path. Every call is recorded before any hold is
//! awaited, so a test can observe that a fetch *started* while it is still
//! blocked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use tokio::sync::watch;
use tracing::trace;

use crate::{Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum MockRoute {
    Respond { status: StatusCode, body: Bytes },
    Fail,
}

/// A [`Fetcher`] that answers from a route table.
///
/// Unrouted paths answer `404`. While offline, every fetch fails.
pub struct MockFetcher {
    routes: Mutex<HashMap<String, MockRoute>>,
    calls: Mutex<Vec<String>>,
    online: AtomicBool,
    hold: watch::Sender<bool>,
}

impl MockFetcher {
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
            hold,
        }
    }

    /// Answer `path` with `status` and `body`.
    pub fn respond(&self, path: &str, status: u16, body: impl Into<Bytes>) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.routes().insert(
            path.to_string(),
            MockRoute::Respond {
                status,
                body: body.into(),
            },
        );
    }

    /// Answer `path` with `200 OK` and `body`.
    pub fn ok(&self, path: &str, body: impl Into<Bytes>) {
        self.respond(path, 200, body);
    }

    /// Make `path` fail with a network error even while online.
    pub fn fail(&self, path: &str) {
        self.routes().insert(path.to_string(), MockRoute::Fail);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Block every fetch (after it is recorded) until [`release`](Self::release).
    pub fn hold(&self) {
        self.hold.send_replace(true);
    }

    pub fn release(&self) {
        self.hold.send_replace(false);
    }

    /// Total number of fetches issued.
    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    /// Number of fetches issued for `path`.
    pub fn calls_for(&self, path: &str) -> usize {
        self.calls().iter().filter(|p| p.as_str() == path).count()
    }

    pub fn reset_calls(&self) {
        self.calls().clear();
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockRoute>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn calls(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let path = request.url.path().to_string();
        self.calls().push(path.clone());
        trace!(%path, "Mock fetch");

        let mut hold = self.hold.subscribe();
        // The sender lives in `self`, so this only errors if `self` is gone.
        let _ = hold.wait_for(|held| !*held).await;

        if !self.online.load(Ordering::SeqCst) {
            return Err(NetError::Offline(path));
        }

        let route = self.routes().get(&path).cloned();
        match route {
            Some(MockRoute::Respond { status, body }) => {
                Ok(Response::new(status, body).with_url(request.url.clone()))
            }
            Some(MockRoute::Fail) => Err(NetError::RequestFailed(path)),
            None => Ok(Response::new(StatusCode::NOT_FOUND, Bytes::new())
                .with_url(request.url.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(path: &str) -> Request {
        Request::parse(&format!("https://app.test{path}")).unwrap()
    }

    #[tokio::test]
    async fn test_routes_and_calls() {
        let fetcher = MockFetcher::new();
        fetcher.ok("/a.js", "a");
        fetcher.fail("/broken.js");

        let a = fetcher.fetch(&request("/a.js")).await.unwrap();
        assert!(a.ok());
        assert_eq!(a.text(), "a");

        let missing = fetcher.fetch(&request("/nope")).await.unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        assert!(fetcher.fetch(&request("/broken.js")).await.is_err());
        assert_eq!(fetcher.call_count(), 3);
        assert_eq!(fetcher.calls_for("/a.js"), 1);
    }

    #[tokio::test]
    async fn test_offline() {
        let fetcher = MockFetcher::new();
        fetcher.ok("/a.js", "a");
        fetcher.set_online(false);

        assert!(matches!(
            fetcher.fetch(&request("/a.js")).await,
            Err(NetError::Offline(_))
        ));
        assert_eq!(fetcher.calls_for("/a.js"), 1);
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.ok("/slow", "done");
        fetcher.hold();

        let task = {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move { fetcher.fetch(&request("/slow")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        assert_eq!(fetcher.calls_for("/slow"), 1);

        fetcher.release();
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.text(), "done");
    }
}
