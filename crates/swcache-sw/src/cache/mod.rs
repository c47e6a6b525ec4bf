//! Cache Store Manager.
//!
//! Named namespaces of request → response snapshots, stored behind the
//! [`CacheBackend`] trait. The manager adds the engine's rules on top:
//! only ok GET responses are written, and pruning only ever touches
//! namespaces carrying the engine prefix.
//!
//! ```text
//! CacheStoreManager
//!     └── dyn CacheBackend (MemoryCacheStorage)
//!             └── namespace (generation N)
//!                     └── "GET https://…" → CachedEntry
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hashbrown::HashSet;
use http::Method;
use swcache_net::{Request, Response};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

mod memory;

pub use memory::MemoryCacheStorage;

/// Errors from cache storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The write violates the storage invariant (non-GET or non-ok).
    #[error("Refusing to cache {key}: {reason}")]
    Rejected { key: String, reason: String },

    /// The handle refers to a namespace that has since been deleted.
    #[error("Stale handle for namespace {0}")]
    StaleHandle(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

// ==================== Naming ====================

/// Kind of namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    /// Content-hashed build assets.
    Static,
    /// App shell, documents, prefetch data and public assets.
    App,
    /// Fonts; survives deploys.
    Font,
}

impl NamespaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceKind::Static => "static",
            NamespaceKind::App => "app",
            NamespaceKind::Font => "font",
        }
    }

    /// Versioned namespaces embed the deploy version in their name.
    pub fn versioned(&self) -> bool {
        !matches!(self, NamespaceKind::Font)
    }
}

/// A named cache namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamespace {
    pub name: String,
    pub kind: NamespaceKind,
    pub versioned: bool,
}

impl CacheNamespace {
    fn new(prefix: &str, version: &str, kind: NamespaceKind) -> Self {
        let name = if kind.versioned() {
            format!("{prefix}-{}-{version}", kind.as_str())
        } else {
            format!("{prefix}-{}", kind.as_str())
        };
        Self {
            name,
            kind,
            versioned: kind.versioned(),
        }
    }
}

/// The namespaces owned by one engine version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
    prefix: String,
    version: String,
    pub static_ns: CacheNamespace,
    pub app: CacheNamespace,
    pub font: CacheNamespace,
}

impl CacheNames {
    pub fn new(prefix: &str, version: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            version: version.to_string(),
            static_ns: CacheNamespace::new(prefix, version, NamespaceKind::Static),
            app: CacheNamespace::new(prefix, version, NamespaceKind::App),
            font: CacheNamespace::new(prefix, version, NamespaceKind::Font),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get(&self, kind: NamespaceKind) -> &CacheNamespace {
        match kind {
            NamespaceKind::Static => &self.static_ns,
            NamespaceKind::App => &self.app,
            NamespaceKind::Font => &self.font,
        }
    }

    /// Everything this version keeps at activation.
    pub fn current_keep_set(&self) -> HashSet<String> {
        [&self.static_ns, &self.app, &self.font]
            .into_iter()
            .map(|ns| ns.name.clone())
            .collect()
    }

    /// What survives a user-triggered clear.
    pub fn font_keep_set(&self) -> HashSet<String> {
        std::iter::once(self.font.name.clone()).collect()
    }
}

/// Whether `name` belongs to the engine with `prefix`.
pub fn is_engine_namespace(prefix: &str, name: &str) -> bool {
    name.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('-'))
}

// ==================== Entries ====================

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    /// `METHOD url` key.
    pub key: String,
    pub url: Url,
    pub response: Response,
    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

/// An opened namespace. Writes through a handle whose namespace has been
/// deleted since it was opened are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    name: String,
    generation: u64,
}

impl CacheHandle {
    pub(crate) fn new(name: &str, generation: u64) -> Self {
        Self {
            name: name.to_string(),
            generation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ==================== Backend ====================

/// Storage for cache namespaces, shared by every worker version and client.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Open a namespace, creating it if needed.
    async fn open(&self, name: &str) -> Result<CacheHandle, StoreError>;

    /// Look up `key` in the namespace behind `handle`.
    async fn lookup(&self, handle: &CacheHandle, key: &str) -> Result<Option<CachedEntry>, StoreError>;

    /// Look up `key` across all namespaces.
    async fn lookup_any(&self, key: &str) -> Result<Option<CachedEntry>, StoreError>;

    /// Insert or replace an entry.
    async fn store(&self, handle: &CacheHandle, entry: CachedEntry) -> Result<(), StoreError>;

    /// Delete a namespace. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    /// Names of all namespaces.
    async fn names(&self) -> Result<Vec<String>, StoreError>;
}

// ==================== Manager ====================

/// Cache Store Manager.
#[derive(Clone)]
pub struct CacheStoreManager {
    backend: Arc<dyn CacheBackend>,
}

impl CacheStoreManager {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Manager over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStorage::new()))
    }

    pub async fn open(&self, name: &str) -> Result<CacheHandle, StoreError> {
        self.backend.open(name).await
    }

    /// Match a request. Backend failures are treated as a miss.
    pub async fn match_request(&self, handle: &CacheHandle, request: &Request) -> Option<Response> {
        match self.backend.lookup(handle, &request.cache_key()).await {
            Ok(entry) => entry.map(|e| e.response.into_cached()),
            Err(e) => {
                warn!(namespace = handle.name(), url = %request.url, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Match a request across every namespace.
    pub async fn match_any(&self, request: &Request) -> Option<Response> {
        match self.backend.lookup_any(&request.cache_key()).await {
            Ok(entry) => entry.map(|e| e.response.into_cached()),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Store a response snapshot. Only ok responses to GET requests are
    /// accepted.
    pub async fn put(
        &self,
        handle: &CacheHandle,
        request: &Request,
        response: &Response,
    ) -> Result<(), StoreError> {
        let key = request.cache_key();
        if request.method != Method::GET {
            return Err(StoreError::Rejected {
                key,
                reason: format!("method {}", request.method),
            });
        }
        if !response.ok() {
            return Err(StoreError::Rejected {
                key,
                reason: format!("status {}", response.status),
            });
        }

        let entry = CachedEntry {
            key,
            url: request.url.clone(),
            response: response.clone(),
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        };
        self.backend.store(handle, entry).await?;
        debug!(namespace = handle.name(), url = %request.url, "Cached response");
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        self.backend.delete(name).await
    }

    /// All namespace names, sorted.
    pub async fn list_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = self.backend.names().await?;
        names.sort();
        Ok(names)
    }

    /// Delete every namespace carrying `prefix` that is not in `keep`.
    /// Namespaces of other owners on the same origin are left alone.
    ///
    /// Returns the deleted names.
    pub async fn prune(
        &self,
        prefix: &str,
        keep: &HashSet<String>,
    ) -> Result<Vec<String>, StoreError> {
        let doomed: Vec<String> = self
            .backend
            .names()
            .await?
            .into_iter()
            .filter(|name| is_engine_namespace(prefix, name) && !keep.contains(name))
            .collect();

        let results =
            futures::future::join_all(doomed.iter().map(|name| self.backend.delete(name))).await;

        let mut deleted = Vec::with_capacity(doomed.len());
        for (name, result) in doomed.into_iter().zip(results) {
            match result {
                Ok(true) => deleted.push(name),
                // Raced with another prune.
                Ok(false) => {}
                Err(e) => warn!(namespace = %name, error = %e, "Failed to delete namespace"),
            }
        }

        if !deleted.is_empty() {
            info!(?deleted, "Pruned cache namespaces");
        }
        deleted.sort();
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn request(path: &str) -> Request {
        Request::parse(&format!("https://app.test{path}")).unwrap()
    }

    #[test]
    fn test_namespace_naming() {
        let names = CacheNames::new("octopus", "v1");
        assert_eq!(names.static_ns.name, "octopus-static-v1");
        assert_eq!(names.app.name, "octopus-app-v1");
        assert_eq!(names.font.name, "octopus-font");
        assert!(names.static_ns.versioned);
        assert!(!names.font.versioned);
        assert_eq!(names.get(NamespaceKind::App), &names.app);
        assert_eq!(names.current_keep_set().len(), 3);
        assert!(names.font_keep_set().contains("octopus-font"));
    }

    #[test]
    fn test_engine_namespace_detection() {
        assert!(is_engine_namespace("octopus", "octopus-app-v1"));
        assert!(is_engine_namespace("octopus", "octopus-font"));
        assert!(!is_engine_namespace("octopus", "octopussy-app-v1"));
        assert!(!is_engine_namespace("octopus", "workbox-precache"));
        assert!(!is_engine_namespace("octopus", "octopus"));
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let store = CacheStoreManager::in_memory();
        let handle = store.open("octopus-app-v1").await.unwrap();
        let req = request("/logo.svg");

        assert!(store.match_request(&handle, &req).await.is_none());

        store
            .put(&handle, &req, &Response::new(StatusCode::OK, "<svg/>"))
            .await
            .unwrap();

        let hit = store.match_request(&handle, &req).await.unwrap();
        assert_eq!(hit.text(), "<svg/>");
        assert_eq!(hit.source, swcache_net::ResponseSource::Cache);
        assert!(store.match_any(&req).await.is_some());
    }

    #[tokio::test]
    async fn test_put_rejects_non_ok_and_non_get() {
        let store = CacheStoreManager::in_memory();
        let handle = store.open("octopus-app-v1").await.unwrap();

        let not_found = Response::new(StatusCode::NOT_FOUND, "");
        assert!(matches!(
            store.put(&handle, &request("/a"), &not_found).await,
            Err(StoreError::Rejected { .. })
        ));

        let post = request("/a").method(Method::POST);
        let ok = Response::new(StatusCode::OK, "x");
        assert!(matches!(
            store.put(&handle, &post, &ok).await,
            Err(StoreError::Rejected { .. })
        ));

        assert!(store.match_request(&handle, &request("/a")).await.is_none());
    }

    #[tokio::test]
    async fn test_prune_respects_prefix_and_keep_set() {
        let store = CacheStoreManager::in_memory();
        for name in [
            "octopus-static-v1",
            "octopus-app-v1",
            "octopus-static-v2",
            "octopus-app-v2",
            "octopus-font",
            "other-app-cache",
        ] {
            store.open(name).await.unwrap();
        }

        let names = CacheNames::new("octopus", "v2");
        let deleted = store
            .prune(names.prefix(), &names.current_keep_set())
            .await
            .unwrap();

        assert_eq!(deleted, vec!["octopus-app-v1", "octopus-static-v1"]);
        assert_eq!(
            store.list_names().await.unwrap(),
            vec![
                "octopus-app-v2",
                "octopus-font",
                "octopus-static-v2",
                "other-app-cache"
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_resurrect_namespace() {
        let store = CacheStoreManager::in_memory();
        let handle = store.open("octopus-static-v1").await.unwrap();

        assert!(store.delete("octopus-static-v1").await.unwrap());

        let result = store
            .put(&handle, &request("/_next/static/a.js"), &Response::new(StatusCode::OK, "a"))
            .await;
        assert_eq!(
            result,
            Err(StoreError::StaleHandle("octopus-static-v1".to_string()))
        );
        assert!(store.list_names().await.unwrap().is_empty());
    }
}
