//! Cache generations.
//!
//! A generation is one deployed version of the asset set. Its cache is named
//! `prefix + version`; every other cache carrying the prefix is stale and is
//! deleted wholesale on activation.

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{truncate_error, StoreError};
use crate::store::CacheStorage;

/// Result of a bulk cache deletion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    /// Caches whose deletion failed, with the error text
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GenerationManager {
    version: String,
    prefix: String,
    cache_name: String,
}

impl GenerationManager {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            version: config.version.clone(),
            prefix: config.cache_prefix.clone(),
            cache_name: config.cache_name(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Cache belongs to this agent (any generation). Without a prefix
    /// nothing is claimed as ours.
    pub fn owns(&self, name: &str) -> bool {
        !self.prefix.is_empty() && name.starts_with(&self.prefix)
    }

    pub fn is_stale(&self, name: &str) -> bool {
        self.owns(name) && name != self.cache_name
    }

    /// Delete every cache from an older generation.
    ///
    /// Deletions run concurrently and independently; a listing failure aborts
    /// the cleanup and is returned to the caller.
    pub async fn remove_stale(&self, storage: &dyn CacheStorage) -> Result<CleanupReport, StoreError> {
        let stale = storage
            .names()
            .await?
            .into_iter()
            .filter(|name| self.is_stale(name))
            .collect::<Vec<_>>();
        if stale.is_empty() {
            debug!(current = %self.cache_name, "No stale caches");
        }
        Ok(Self::delete_all(storage, stale).await)
    }

    /// Delete every cache this agent owns, current generation included.
    pub async fn remove_owned(&self, storage: &dyn CacheStorage) -> Result<CleanupReport, StoreError> {
        let owned = storage
            .names()
            .await?
            .into_iter()
            .filter(|name| self.owns(name))
            .collect::<Vec<_>>();
        Ok(Self::delete_all(storage, owned).await)
    }

    async fn delete_all(storage: &dyn CacheStorage, names: Vec<String>) -> CleanupReport {
        let results = join_all(names.iter().map(|name| storage.delete(name))).await;

        let mut report = CleanupReport::default();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(_) => {
                    info!(cache = %name, "Deleted cache");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete cache");
                    report.failed.push((name, truncate_error(&e.to_string())));
                }
            }
        }
        report
    }
}
