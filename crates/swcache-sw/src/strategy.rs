//! Strategy executors.
//!
//! Every executor resolves to a [`Response`]. Network failures fall back to
//! the cache, and when neither can answer the result is
//! [`Response::offline`]. Cache write failures are logged and never affect
//! the response being returned.

use std::sync::Arc;

use swcache_net::{Fetcher, Request, Response};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::cache::{CacheHandle, CacheStoreManager};

/// Caching strategy for a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Serve from cache; fetch and store on a miss.
    CacheFirst,
    /// Fetch and write through; fall back to the cache, then to `fallback`
    /// (an origin-relative path) when offline.
    NetworkFirst { fallback: Option<String> },
    /// Serve the cached copy immediately and refresh it in the background.
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::CacheFirst => "cache-first",
            Strategy::NetworkFirst { .. } => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

/// Runs strategies against a store and a network.
#[derive(Clone)]
pub struct StrategyExecutor {
    store: CacheStoreManager,
    fetcher: Arc<dyn Fetcher>,
    tasks: TaskTracker,
}

impl StrategyExecutor {
    /// Background revalidations are spawned on `tasks`.
    pub fn new(store: CacheStoreManager, fetcher: Arc<dyn Fetcher>, tasks: TaskTracker) -> Self {
        Self {
            store,
            fetcher,
            tasks,
        }
    }

    pub async fn execute(&self, strategy: &Strategy, request: &Request, namespace: &str) -> Response {
        match strategy {
            Strategy::CacheFirst => self.cache_first(request, namespace).await,
            Strategy::NetworkFirst { fallback } => {
                self.network_first(request, namespace, fallback.as_deref())
                    .await
            }
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, namespace).await,
        }
    }

    pub async fn cache_first(&self, request: &Request, namespace: &str) -> Response {
        let handle = self.open(namespace).await;

        if let Some(handle) = &handle {
            if let Some(cached) = self.store.match_request(handle, request).await {
                debug!(url = %request.url, namespace, "cache-first hit");
                return cached;
            }
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if let Some(handle) = &handle {
                    self.write_back(handle, request, &response).await;
                }
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "cache-first miss while offline");
                Response::offline()
            }
        }
    }

    pub async fn network_first(
        &self,
        request: &Request,
        namespace: &str,
        fallback: Option<&str>,
    ) -> Response {
        let handle = self.open(namespace).await;

        let error = match self.fetcher.fetch(request).await {
            Ok(response) => {
                if let Some(handle) = &handle {
                    self.write_back(handle, request, &response).await;
                }
                return response;
            }
            Err(e) => e,
        };
        debug!(url = %request.url, error = %error, "network-first falling back to cache");

        let Some(handle) = handle else {
            return Response::offline();
        };

        if let Some(cached) = self.store.match_request(&handle, request).await {
            return cached;
        }

        if let Some(path) = fallback {
            match request.url.join(path) {
                Ok(url) => {
                    if let Some(cached) = self.store.match_request(&handle, &Request::get(url)).await {
                        debug!(url = %request.url, fallback = path, "Serving offline fallback");
                        return cached;
                    }
                }
                Err(e) => warn!(fallback = path, error = %e, "Invalid fallback path"),
            }
        }

        Response::offline()
    }

    pub async fn stale_while_revalidate(&self, request: &Request, namespace: &str) -> Response {
        let handle = self.open(namespace).await;

        // Start the network leg before touching the cache so both run
        // concurrently.
        let revalidation = {
            let this = self.clone();
            let request = request.clone();
            let handle = handle.clone();
            self.tasks.spawn(async move {
                match this.fetcher.fetch(&request).await {
                    Ok(response) => {
                        if let Some(handle) = &handle {
                            this.write_back(handle, &request, &response).await;
                        }
                        Some(response)
                    }
                    Err(e) => {
                        debug!(url = %request.url, error = %e, "Revalidation failed");
                        None
                    }
                }
            })
        };

        if let Some(handle) = &handle {
            if let Some(cached) = self.store.match_request(handle, request).await {
                debug!(url = %request.url, namespace, "Serving stale copy");
                return cached;
            }
        }

        match revalidation.await {
            Ok(Some(response)) => response,
            Ok(None) => Response::offline(),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Revalidation task failed");
                Response::offline()
            }
        }
    }

    async fn open(&self, namespace: &str) -> Option<CacheHandle> {
        match self.store.open(namespace).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(namespace, error = %e, "Failed to open cache namespace");
                None
            }
        }
    }

    /// Best-effort write of an ok response.
    async fn write_back(&self, handle: &CacheHandle, request: &Request, response: &Response) {
        if !response.ok() {
            return;
        }
        if let Err(e) = self.store.put(handle, request, response).await {
            warn!(namespace = handle.name(), url = %request.url, error = %e, "Cache write failed");
        }
    }
}
