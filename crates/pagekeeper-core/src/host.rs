//! Host page registry: the open pages the agent can take control of.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::HostError;

/// A page (client) known to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: String,
    pub url: String,
    /// Served by the current agent generation
    pub controlled: bool,
}

#[async_trait]
pub trait ClientRegistry: Send + Sync {
    async fn clients(&self) -> Vec<ClientInfo>;

    /// Take control of every open page without a reload. Returns how many
    /// pages changed hands.
    async fn claim(&self) -> Result<usize, HostError>;

    /// Ask the host to skip the grace period for the waiting generation.
    async fn skip_waiting(&self);
}

/// Registry kept by an embedding host in-process.
#[derive(Default)]
pub struct LocalClients {
    clients: RwLock<Vec<ClientInfo>>,
    skip_waiting: AtomicBool,
}

impl LocalClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: impl Into<String>, url: impl Into<String>) {
        self.clients.write().await.push(ClientInfo {
            id: id.into(),
            url: url.into(),
            controlled: false,
        });
    }

    pub async fn unregister(&self, id: &str) {
        self.clients.write().await.retain(|c| c.id != id);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientRegistry for LocalClients {
    async fn clients(&self) -> Vec<ClientInfo> {
        self.clients.read().await.clone()
    }

    async fn claim(&self) -> Result<usize, HostError> {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for client in clients.iter_mut().filter(|c| !c.controlled) {
            client.controlled = true;
            claimed += 1;
        }
        debug!(claimed, total = clients.len(), "Clients claimed");
        Ok(claimed)
    }

    async fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }
}
