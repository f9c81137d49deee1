//! Caching strategies.
//!
//! The primary path is cache-first with background refresh: a hit is
//! answered straight from the cache while a detached task refetches the
//! resource and overwrites the entry. A miss goes to the network and stores
//! the result. When the primary path fails, the network-first fallback
//! retries the network and, for navigations, substitutes the cached home
//! document.
//!
//! Only responses with a 2xx status are ever written. Error responses are
//! still handed back to the caller.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{truncate_error, AgentError, AgentResult};
use crate::http::{Request, RequestKey, Response};
use crate::network::Network;
use crate::store::{Cache, CacheStorage};

/// Outcome of one background refresh, fed to the refresh observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub key: RequestKey,
    pub result: RefreshResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshResult {
    Updated,
    /// Network answered with a non-2xx status; the entry was kept
    NotOk { status: u16 },
    Failed(String),
}

pub struct StrategyEngine {
    cache_name: String,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    /// Keys tried in order when a navigation cannot reach the network
    fallback_keys: Vec<RequestKey>,
    refresh_tx: mpsc::Sender<RefreshOutcome>,
}

impl StrategyEngine {
    pub fn new(
        cache_name: impl Into<String>,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        fallback_keys: Vec<RequestKey>,
        refresh_tx: mpsc::Sender<RefreshOutcome>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            storage,
            network,
            fallback_keys,
            refresh_tx,
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Answer a cacheable request: cache-first, then network-first fallback.
    pub async fn respond(&self, request: &Request) -> AgentResult<Response> {
        match self.cache_first(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(url = %request.key(), error = %e, "Cache-first failed, trying fallback");
                self.network_first(request).await
            }
        }
    }

    /// Serve from cache when present (refreshing in the background),
    /// otherwise fetch and store.
    pub async fn cache_first(&self, request: &Request) -> AgentResult<Response> {
        let key = request.key();
        let cache = self.storage.open(&self.cache_name).await?;

        if let Some(hit) = cache.lookup(&key).await? {
            debug!(url = %key, age_minutes = hit.age_minutes(), "Cache hit");
            self.spawn_refresh(request.clone());
            return Ok(hit.response);
        }

        debug!(url = %key, "Cache miss");
        let response = self.network.fetch(request).await?;
        self.store_if_ok(cache.as_ref(), key, &response).await;
        Ok(response)
    }

    /// Network first; on failure a navigation gets the cached home document.
    pub async fn network_first(&self, request: &Request) -> AgentResult<Response> {
        let key = request.key();
        match self.network.fetch(request).await {
            Ok(response) => {
                match self.storage.open(&self.cache_name).await {
                    Ok(cache) => self.store_if_ok(cache.as_ref(), key, &response).await,
                    Err(e) => warn!(url = %key, error = %e, "Cannot open cache to store response"),
                }
                Ok(response)
            }
            Err(e) if request.is_navigation() => match self.offline_document().await {
                Some(document) => {
                    info!(url = %key, "Offline, serving cached home document");
                    Ok(document)
                }
                None => Err(AgentError::Offline {
                    url: key.to_string(),
                    source: e,
                }),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn offline_document(&self) -> Option<Response> {
        let cache = match self.storage.open(&self.cache_name).await {
            Ok(cache) => cache,
            Err(e) => {
                warn!(error = %e, "Cannot open cache for offline fallback");
                return None;
            }
        };
        for key in &self.fallback_keys {
            match cache.lookup(key).await {
                Ok(Some(hit)) => return Some(hit.response),
                Ok(None) => continue,
                Err(e) => warn!(url = %key, error = %e, "Offline fallback lookup failed"),
            }
        }
        None
    }

    async fn store_if_ok(&self, cache: &dyn Cache, key: RequestKey, response: &Response) {
        if !response.is_ok() {
            debug!(url = %key, status = response.status, "Not caching error response");
            return;
        }
        // A failed write must not cost the caller its response
        if let Err(e) = cache.put(key.clone(), response.clone()).await {
            warn!(url = %key, error = %e, "Failed to cache response");
        }
    }

    /// Detached refetch of a cached resource. Its result only reaches the
    /// log and the refresh observer, never the caller.
    fn spawn_refresh(&self, request: Request) {
        let storage = Arc::clone(&self.storage);
        let network = Arc::clone(&self.network);
        let cache_name = self.cache_name.clone();
        let tx = self.refresh_tx.clone();

        tokio::spawn(async move {
            let key = request.key();
            let result = refresh(storage.as_ref(), network.as_ref(), &cache_name, &request).await;
            match &result {
                RefreshResult::Updated => debug!(url = %key, "Background refresh stored"),
                RefreshResult::NotOk { status } => {
                    debug!(url = %key, status, "Background refresh got error status, kept cached copy")
                }
                RefreshResult::Failed(e) => debug!(url = %key, error = %e, "Background refresh failed"),
            }
            report(&tx, RefreshOutcome { key, result });
        });
    }
}

async fn refresh(
    storage: &dyn CacheStorage,
    network: &dyn Network,
    cache_name: &str,
    request: &Request,
) -> RefreshResult {
    let response = match network.fetch(request).await {
        Ok(response) => response,
        Err(e) => return RefreshResult::Failed(truncate_error(&e.to_string())),
    };
    if !response.is_ok() {
        return RefreshResult::NotOk {
            status: response.status,
        };
    }
    let stored = match storage.open(cache_name).await {
        Ok(cache) => cache.put(request.key(), response).await,
        Err(e) => Err(e),
    };
    match stored {
        Ok(()) => RefreshResult::Updated,
        Err(e) => RefreshResult::Failed(truncate_error(&e.to_string())),
    }
}

/// Offer an outcome to the observer without ever waiting on it
fn report(tx: &mpsc::Sender<RefreshOutcome>, outcome: RefreshOutcome) {
    if let Err(e) = tx.try_send(outcome) {
        debug!(error = %e, "Refresh outcome dropped");
    }
}
