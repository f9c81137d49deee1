use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Cache, CacheStorage, StoredResponse};
use crate::error::StoreError;
use crate::http::{RequestKey, Response};

/// In-process cache storage.
///
/// Deleting a cache detaches it: handles opened earlier keep working but
/// the name no longer resolves to them.
#[derive(Default)]
pub struct MemoryStorage {
    caches: RwLock<BTreeMap<String, Arc<MemoryCache>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<RequestKey, StoredResponse>>,
}

#[async_trait]
impl Cache for MemoryCache {
    async fn lookup(&self, key: &RequestKey) -> Result<Option<StoredResponse>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: RequestKey, response: Response) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key, StoredResponse::new(response));
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(RequestKey, Response)>) -> Result<(), StoreError> {
        let mut map = self.entries.write().await;
        for (key, response) in entries {
            map.insert(key, StoredResponse::new(response));
        }
        Ok(())
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, StoreError> {
        let mut keys: Vec<_> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, StoreError> {
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCache::default()));
        Ok(Arc::clone(cache) as Arc<dyn Cache>)
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.caches.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    fn key(path: &str) -> RequestKey {
        RequestKey::from_url(&Url::parse(&format!("https://tools.example.com{}", path)).unwrap())
    }

    #[tokio::test]
    async fn test_open_creates_cache() {
        let storage = MemoryStorage::new();
        assert!(!storage.has("pagekeeper-1").await.unwrap());
        storage.open("pagekeeper-1").await.unwrap();
        assert!(storage.has("pagekeeper-1").await.unwrap());
        assert_eq!(storage.names().await.unwrap(), vec!["pagekeeper-1"]);
    }

    #[tokio::test]
    async fn test_open_same_name_shares_entries() {
        let storage = MemoryStorage::new();
        let a = storage.open("c").await.unwrap();
        let b = storage.open("c").await.unwrap();
        a.put(key("/"), Response::new("/", 200, "home")).await.unwrap();
        let hit = b.lookup(&key("/")).await.unwrap().unwrap();
        assert_eq!(hit.response.text(), "home");
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let storage = MemoryStorage::new();
        let cache = storage.open("c").await.unwrap();
        cache.put(key("/a"), Response::new("/a", 200, "one")).await.unwrap();
        cache.put(key("/a"), Response::new("/a", 200, "two")).await.unwrap();
        assert_eq!(cache.keys().await.unwrap().len(), 1);
        let hit = cache.lookup(&key("/a")).await.unwrap().unwrap();
        assert_eq!(hit.response.text(), "two");
    }

    #[tokio::test]
    async fn test_delete_cache_removes_entries() {
        let storage = MemoryStorage::new();
        let cache = storage.open("c").await.unwrap();
        cache.put(key("/a"), Response::new("/a", 200, "one")).await.unwrap();

        assert!(storage.delete("c").await.unwrap());
        assert!(!storage.delete("c").await.unwrap());

        let reopened = storage.open("c").await.unwrap();
        assert!(reopened.lookup(&key("/a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let storage = MemoryStorage::new();
        let cache = storage.open("c").await.unwrap();
        cache
            .put_all(vec![
                (key("/a"), Response::new("/a", 200, "a")),
                (key("/b"), Response::new("/b", 200, "b")),
            ])
            .await
            .unwrap();
        assert!(cache.delete(&key("/a")).await.unwrap());
        assert!(!cache.delete(&key("/a")).await.unwrap());
        assert_eq!(cache.keys().await.unwrap(), vec![key("/b")]);
    }
}
