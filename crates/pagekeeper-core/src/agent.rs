//! Single entry point for host events.
//!
//! The host hands every lifecycle, fetch and message event to
//! [`Agent::dispatch`] and keeps the triggering event pending until the
//! returned future resolves.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::classifier::{RequestClassifier, Verdict};
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::host::ClientRegistry;
use crate::http::{Request, RequestKey, Response};
use crate::lifecycle::{ActivationReport, InstallReport, LifecycleController, LifecycleState};
use crate::message::ChannelMessage;
use crate::network::Network;
use crate::store::CacheStorage;
use crate::strategy::{RefreshOutcome, StrategyEngine};

/// Buffered refresh outcomes before new ones are dropped
const REFRESH_CHANNEL_BUFFER: usize = 64;

#[derive(Debug)]
pub enum Event {
    Install,
    Activate,
    Fetch(Request),
    Message(ChannelMessage),
}

#[derive(Debug)]
pub enum Outcome {
    Installed(InstallReport),
    Activated(ActivationReport),
    Response(Response),
    /// Not intercepted; the host performs its default network handling
    Passthrough(Verdict),
    MessageHandled,
}

pub struct Agent {
    classifier: RequestClassifier,
    strategy: StrategyEngine,
    lifecycle: LifecycleController,
    refresh_rx: Mutex<Option<mpsc::Receiver<RefreshOutcome>>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        clients: Arc<dyn ClientRegistry>,
    ) -> AgentResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let fallback_keys = config
            .offline_fallbacks
            .iter()
            .map(|path| config.resolve(path).map(|url| RequestKey::from_url(&url)))
            .collect::<AgentResult<Vec<_>>>()?;

        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_CHANNEL_BUFFER);
        let lifecycle = LifecycleController::new(
            Arc::clone(&config),
            Arc::clone(&storage),
            Arc::clone(&network),
            clients,
        );
        let strategy = StrategyEngine::new(
            lifecycle.generation().cache_name(),
            storage,
            network,
            fallback_keys,
            refresh_tx,
        );

        Ok(Self {
            classifier: RequestClassifier::new(&config),
            strategy,
            lifecycle,
            refresh_rx: Mutex::new(Some(refresh_rx)),
        })
    }

    pub fn version(&self) -> &str {
        self.lifecycle.generation().version()
    }

    pub fn cache_name(&self) -> &str {
        self.strategy.cache_name()
    }

    pub async fn state(&self) -> LifecycleState {
        self.lifecycle.state().await
    }

    /// Hand the stream of background refresh outcomes to an observer.
    /// Only the first caller gets it.
    pub async fn take_refresh_events(&self) -> Option<mpsc::Receiver<RefreshOutcome>> {
        self.refresh_rx.lock().await.take()
    }

    pub async fn dispatch(&self, event: Event) -> AgentResult<Outcome> {
        match event {
            Event::Install => Ok(Outcome::Installed(self.lifecycle.install().await?)),
            Event::Activate => Ok(Outcome::Activated(self.lifecycle.activate().await?)),
            Event::Fetch(request) => self.handle_fetch(&request).await,
            Event::Message(message) => {
                self.lifecycle.handle_message(message).await?;
                Ok(Outcome::MessageHandled)
            }
        }
    }

    async fn handle_fetch(&self, request: &Request) -> AgentResult<Outcome> {
        let verdict = self.classifier.classify(request);
        if !verdict.is_cacheable() {
            debug!(method = %request.method, url = %request.url, ?verdict, "Passing through");
            return Ok(Outcome::Passthrough(verdict));
        }

        match self.strategy.respond(request).await {
            Ok(response) => Ok(Outcome::Response(response)),
            Err(e) => {
                if e.is_network() {
                    debug!(url = %request.url, error = %e, "Request failed offline");
                } else {
                    warn!(url = %request.url, error = %e, "Request failed");
                }
                Err(e)
            }
        }
    }
}
