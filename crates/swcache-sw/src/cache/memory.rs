//! In-memory [`CacheBackend`].

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use super::{CacheBackend, CacheHandle, CachedEntry, StoreError};

#[derive(Debug)]
struct Namespace {
    generation: u64,
    entries: HashMap<String, CachedEntry>,
}

/// Process-wide cache storage held in memory.
///
/// Every namespace is stamped with a generation when created. Deleting a
/// namespace retires its generation, so writes through handles opened
/// before the delete are refused instead of recreating it.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    namespaces: RwLock<HashMap<String, Namespace>>,
    next_generation: AtomicU64,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) async fn len_of(&self, name: &str) -> Option<usize> {
        self.namespaces
            .read()
            .await
            .get(name)
            .map(|ns| ns.entries.len())
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<CacheHandle, StoreError> {
        if let Some(ns) = self.namespaces.read().await.get(name) {
            return Ok(CacheHandle::new(name, ns.generation));
        }

        let mut namespaces = self.namespaces.write().await;
        let ns = namespaces.entry(name.to_string()).or_insert_with(|| Namespace {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            entries: HashMap::new(),
        });
        Ok(CacheHandle::new(name, ns.generation))
    }

    async fn lookup(&self, handle: &CacheHandle, key: &str) -> Result<Option<CachedEntry>, StoreError> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces
            .get(handle.name())
            .filter(|ns| ns.generation == handle.generation())
            .and_then(|ns| ns.entries.get(key))
            .cloned())
    }

    async fn lookup_any(&self, key: &str) -> Result<Option<CachedEntry>, StoreError> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces
            .values()
            .find_map(|ns| ns.entries.get(key))
            .cloned())
    }

    async fn store(&self, handle: &CacheHandle, entry: CachedEntry) -> Result<(), StoreError> {
        let mut namespaces = self.namespaces.write().await;
        match namespaces.get_mut(handle.name()) {
            Some(ns) if ns.generation == handle.generation() => {
                ns.entries.insert(entry.key.clone(), entry);
                Ok(())
            }
            _ => Err(StoreError::StaleHandle(handle.name().to_string())),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.namespaces.write().await.remove(name).is_some())
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.namespaces.read().await.keys().cloned().collect())
    }
}
