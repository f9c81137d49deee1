//! Persistent cache store adapter.
//!
//! A `CacheStorage` is a set of named caches; each `Cache` maps a
//! `RequestKey` to a stored response snapshot. Puts replace whole entries
//! and overlapping writes to the same key resolve last-write-wins.
//!
//! Two backends are provided:
//! - `MemoryStorage`: process-local, for tests and embedded hosts
//! - `DiskStorage`: one JSON file per cache under a root directory

pub mod disk;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::http::{RequestKey, Response};

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

/// A response snapshot plus the time it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub response: Response,
    pub cached_at: DateTime<Utc>,
}

impl StoredResponse {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes().max(0)
    }
}

/// One named cache generation.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn lookup(&self, key: &RequestKey) -> Result<Option<StoredResponse>, StoreError>;

    /// Store a response, replacing any existing entry for `key`.
    async fn put(&self, key: RequestKey, response: Response) -> Result<(), StoreError>;

    /// Store several entries in one step: either all land or none do.
    async fn put_all(&self, entries: Vec<(RequestKey, Response)>) -> Result<(), StoreError>;

    async fn delete(&self, key: &RequestKey) -> Result<bool, StoreError>;

    async fn keys(&self) -> Result<Vec<RequestKey>, StoreError>;
}

/// The host's set of named caches.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it when absent.
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, StoreError>;

    async fn has(&self, name: &str) -> Result<bool, StoreError>;

    /// Delete a whole cache. Returns false when it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    async fn names(&self) -> Result<Vec<String>, StoreError>;
}
