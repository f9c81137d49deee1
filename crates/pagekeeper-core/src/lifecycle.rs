//! Install, activation and the command protocol.
//!
//! Install pre-caches the core assets all-or-nothing: a generation is either
//! fully warmed or never advances. Activation removes stale generations and
//! claims open pages concurrently; both finish before activation resolves.

use std::fmt;
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::{truncate_error, AgentError, AgentResult};
use crate::generation::GenerationManager;
use crate::host::ClientRegistry;
use crate::http::{Request, RequestKey, Response};
use crate::message::{ChannelMessage, Command, Reply};
use crate::network::Network;
use crate::store::CacheStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Parsed,
    Installing,
    /// Installed, waiting for the previous generation to let go
    Installed,
    Activating,
    Activated,
    /// Install failed; this generation never becomes current
    Redundant,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Parsed => "parsed",
            LifecycleState::Installing => "installing",
            LifecycleState::Installed => "installed",
            LifecycleState::Activating => "activating",
            LifecycleState::Activated => "activated",
            LifecycleState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub cache_name: String,
    pub core_cached: usize,
    pub optional_cached: usize,
    /// Optional assets that could not be cached, with the reason
    pub optional_failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub claimed: usize,
    /// Set when the cache listing failed and no cleanup happened
    pub cleanup_error: Option<String>,
}

pub struct LifecycleController {
    config: Arc<AgentConfig>,
    generation: GenerationManager,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<dyn ClientRegistry>,
    state: RwLock<LifecycleState>,
}

impl LifecycleController {
    pub fn new(
        config: Arc<AgentConfig>,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        clients: Arc<dyn ClientRegistry>,
    ) -> Self {
        Self {
            generation: GenerationManager::new(&config),
            config,
            storage,
            network,
            clients,
            state: RwLock::new(LifecycleState::Parsed),
        }
    }

    pub fn generation(&self) -> &GenerationManager {
        &self.generation
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    async fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.write().await;
        let previous = *state;
        debug!(from = %previous, to = %next, "Lifecycle transition");
        *state = next;
    }

    /// Pre-warm the current generation's cache.
    pub async fn install(&self) -> AgentResult<InstallReport> {
        self.set_state(LifecycleState::Installing).await;
        info!(cache = %self.generation.cache_name(), "Installing");

        match self.precache().await {
            Ok(report) => {
                self.clients.skip_waiting().await;
                self.set_state(LifecycleState::Installed).await;
                info!(
                    cache = %report.cache_name,
                    core = report.core_cached,
                    optional = report.optional_cached,
                    "Install complete"
                );
                Ok(report)
            }
            Err(e) => {
                error!(cache = %self.generation.cache_name(), error = %e, "Install failed");
                self.set_state(LifecycleState::Redundant).await;
                Err(e)
            }
        }
    }

    async fn precache(&self) -> AgentResult<InstallReport> {
        let cache = self.storage.open(self.generation.cache_name()).await?;

        let core = self
            .config
            .core_assets
            .iter()
            .map(|path| self.config.resolve(path))
            .collect::<AgentResult<Vec<_>>>()?;

        // Every core asset must fetch with an ok status before anything is written
        let fetched = try_join_all(core.into_iter().map(|url| self.fetch_asset(Request::get(url)))).await?;
        let core_cached = fetched.len();
        cache.put_all(fetched).await?;

        let mut report = InstallReport {
            cache_name: self.generation.cache_name().to_string(),
            core_cached,
            ..Default::default()
        };

        let cache = cache.as_ref();
        let optional = join_all(self.config.optional_assets.iter().map(|path| async move {
            let url = self.config.resolve(path)?;
            let (key, response) = self.fetch_asset(Request::get(url)).await?;
            cache.put(key, response).await?;
            Ok::<_, AgentError>(())
        }))
        .await;

        for (path, result) in self.config.optional_assets.iter().zip(optional) {
            match result {
                Ok(()) => report.optional_cached += 1,
                Err(e) => {
                    warn!(asset = %path, error = %e, "Optional asset not cached");
                    report
                        .optional_failed
                        .push((path.clone(), truncate_error(&e.to_string())));
                }
            }
        }

        Ok(report)
    }

    async fn fetch_asset(&self, request: Request) -> AgentResult<(RequestKey, Response)> {
        let response = self.network.fetch(&request).await?;
        if !response.is_ok() {
            return Err(AgentError::AssetStatus {
                url: request.url.to_string(),
                status: response.status,
            });
        }
        Ok((request.key(), response))
    }

    /// Drop stale generations and take over open pages.
    ///
    /// Only an installed generation activates; retrying an activation that
    /// is in progress or done is allowed. Any other state is refused before
    /// a single store is touched.
    ///
    /// A failed cache listing does not stop the claim: the new generation
    /// still takes over and the stale caches are removed on a later
    /// activation or `CLEAR_CACHE`.
    pub async fn activate(&self) -> AgentResult<ActivationReport> {
        self.begin_activation().await?;
        info!(cache = %self.generation.cache_name(), "Activating");

        let (cleanup, claim) = tokio::join!(
            self.generation.remove_stale(self.storage.as_ref()),
            self.clients.claim()
        );

        let claimed = claim?;
        let mut report = ActivationReport {
            claimed,
            ..Default::default()
        };
        match cleanup {
            Ok(cleanup) => {
                report.deleted = cleanup.deleted;
                report.failed = cleanup.failed;
            }
            Err(e) => {
                warn!(error = %e, "Cache listing failed, stale caches kept for now");
                report.cleanup_error = Some(truncate_error(&e.to_string()));
            }
        }

        self.set_state(LifecycleState::Activated).await;
        info!(
            version = %self.generation.version(),
            deleted = report.deleted.len(),
            claimed = report.claimed,
            "Activated"
        );
        Ok(report)
    }

    async fn begin_activation(&self) -> AgentResult<()> {
        let mut state = self.state.write().await;
        let previous = *state;
        match previous {
            LifecycleState::Installed | LifecycleState::Activating | LifecycleState::Activated => {
                debug!(from = %previous, to = %LifecycleState::Activating, "Lifecycle transition");
                *state = LifecycleState::Activating;
                Ok(())
            }
            _ => {
                warn!(state = %previous, cache = %self.generation.cache_name(), "Refusing to activate");
                Err(AgentError::InvalidState {
                    from: previous,
                    to: LifecycleState::Activating,
                })
            }
        }
    }

    /// Handle one command from a page.
    pub async fn handle_message(&self, message: ChannelMessage) -> AgentResult<()> {
        let ChannelMessage { command, reply } = message;
        match command {
            Command::SkipWaiting => {
                let state = self.state().await;
                info!(state = %state, "Skip waiting requested");
                self.clients.skip_waiting().await;
            }
            Command::GetVersion => {
                send_reply(
                    reply,
                    Reply::Version {
                        version: self.generation.version().to_string(),
                    },
                );
            }
            Command::ClearCache => {
                let report = self.generation.remove_owned(self.storage.as_ref()).await?;
                if !report.is_complete() {
                    return Err(AgentError::Cleanup {
                        failed: report.failed.into_iter().map(|(name, _)| name).collect(),
                    });
                }
                info!(deleted = report.deleted.len(), "All caches cleared");
                send_reply(reply, Reply::CacheCleared);
            }
            Command::Unrecognized(kind) => {
                warn!(kind = %kind, "Ignoring unrecognized message");
            }
        }
        Ok(())
    }
}

fn send_reply(port: Option<tokio::sync::oneshot::Sender<Reply>>, reply: Reply) {
    match port {
        Some(port) => {
            if port.send(reply).is_err() {
                debug!("Reply port closed before the reply was sent");
            }
        }
        None => debug!(?reply, "No reply port, reply dropped"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use reqwest::Url;

    use super::*;
    use crate::error::{FetchError, HostError};
    use crate::host::{ClientInfo, LocalClients};
    use crate::store::MemoryStorage;

    #[derive(Default)]
    struct FakeNetwork {
        routes: Mutex<HashMap<String, u16>>,
        /// Prefixed to every body so successive deploys serve different content
        release: Mutex<String>,
    }

    impl FakeNetwork {
        fn set_release(&self, release: &str) {
            *self.release.lock().unwrap() = release.to_string();
        }

        fn serving(paths: &[(&str, u16)]) -> Arc<Self> {
            let network = Self::default();
            for (path, status) in paths {
                network
                    .routes
                    .lock()
                    .unwrap()
                    .insert(url(path).to_string(), *status);
            }
            Arc::new(network)
        }
    }

    #[async_trait]
    impl Network for FakeNetwork {
        async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
            let status = self.routes.lock().unwrap().get(request.url.as_str()).copied();
            match status {
                Some(status) => {
                    let body = format!("{}{}", self.release.lock().unwrap(), request.url.path());
                    Ok(Response::new(request.url.as_str(), status, body))
                }
                None => Err(FetchError::Unreachable("offline".to_string())),
            }
        }
    }

    struct RejectingClients;

    #[async_trait]
    impl ClientRegistry for RejectingClients {
        async fn clients(&self) -> Vec<ClientInfo> {
            Vec::new()
        }

        async fn claim(&self) -> Result<usize, HostError> {
            Err(HostError::ClaimRejected("not active".to_string()))
        }

        async fn skip_waiting(&self) {}
    }

    fn url(path: &str) -> Url {
        Url::parse("https://tools.example.com/")
            .unwrap()
            .join(path.trim_start_matches('/'))
            .unwrap()
    }

    fn config(version: &str) -> Arc<AgentConfig> {
        Arc::new(
            AgentConfig::new(version, Url::parse("https://tools.example.com/").unwrap())
                .with_core_assets(&["/", "/index.html"])
                .with_optional_assets(&["/img/logo.png"]),
        )
    }

    fn controller(
        version: &str,
        storage: Arc<MemoryStorage>,
        network: Arc<FakeNetwork>,
        clients: Arc<LocalClients>,
    ) -> LifecycleController {
        LifecycleController::new(config(version), storage, network, clients)
    }

    #[tokio::test]
    async fn test_install_caches_core_and_optional() {
        let storage = Arc::new(MemoryStorage::new());
        let clients = Arc::new(LocalClients::new());
        let network = FakeNetwork::serving(&[("/", 200), ("/index.html", 200), ("/img/logo.png", 200)]);
        let lifecycle = controller("v1", Arc::clone(&storage), network, Arc::clone(&clients));

        let report = lifecycle.install().await.unwrap();
        assert_eq!(report.core_cached, 2);
        assert_eq!(report.optional_cached, 1);
        assert!(report.optional_failed.is_empty());
        assert_eq!(lifecycle.state().await, LifecycleState::Installed);
        assert!(clients.skip_waiting_requested());

        let cache = storage.open("pagekeeper-v1").await.unwrap();
        assert_eq!(cache.keys().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_install_fails_when_any_core_asset_fails() {
        let storage = Arc::new(MemoryStorage::new());
        let clients = Arc::new(LocalClients::new());
        let network = FakeNetwork::serving(&[("/", 200), ("/index.html", 404)]);
        let lifecycle = controller("v1", Arc::clone(&storage), network, Arc::clone(&clients));

        let err = lifecycle.install().await.unwrap_err();
        assert!(matches!(err, AgentError::AssetStatus { status: 404, .. }));
        assert_eq!(lifecycle.state().await, LifecycleState::Redundant);
        assert!(!clients.skip_waiting_requested());

        // Nothing from the failed batch was written
        let cache = storage.open("pagekeeper-v1").await.unwrap();
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_optional_asset_failure_does_not_fail_install() {
        let storage = Arc::new(MemoryStorage::new());
        let network = FakeNetwork::serving(&[("/", 200), ("/index.html", 200)]);
        let lifecycle = controller("v1", storage, network, Arc::new(LocalClients::new()));

        let report = lifecycle.install().await.unwrap();
        assert_eq!(report.optional_cached, 0);
        assert_eq!(report.optional_failed.len(), 1);
        assert_eq!(report.optional_failed[0].0, "/img/logo.png");
    }

    #[tokio::test]
    async fn test_install_twice_keeps_latest_content() {
        let storage = Arc::new(MemoryStorage::new());
        let network = FakeNetwork::serving(&[("/", 200), ("/index.html", 200)]);
        let lifecycle = controller(
            "v1",
            Arc::clone(&storage),
            Arc::clone(&network),
            Arc::new(LocalClients::new()),
        );

        network.set_release("first:");
        lifecycle.install().await.unwrap();
        network.set_release("second:");
        lifecycle.install().await.unwrap();

        let cache = storage.open("pagekeeper-v1").await.unwrap();
        assert_eq!(cache.keys().await.unwrap().len(), 2);
        for (path, body) in [("/", "second:/"), ("/index.html", "second:/index.html")] {
            let hit = cache.lookup(&RequestKey::from_url(&url(path))).await.unwrap().unwrap();
            assert_eq!(hit.response.text(), body);
        }
    }

    #[tokio::test]
    async fn test_activate_deletes_stale_and_claims() {
        let storage = Arc::new(MemoryStorage::new());
        storage.open("pagekeeper-v0").await.unwrap();
        storage.open("unrelated-v0").await.unwrap();
        let clients = Arc::new(LocalClients::new());
        clients.register("tab-1", "https://tools.example.com/").await;
        let network = FakeNetwork::serving(&[("/", 200), ("/index.html", 200)]);
        let lifecycle = controller("v1", Arc::clone(&storage), network, Arc::clone(&clients));

        lifecycle.install().await.unwrap();
        let report = lifecycle.activate().await.unwrap();
        assert_eq!(report.deleted, vec!["pagekeeper-v0"]);
        assert_eq!(report.claimed, 1);
        assert!(report.cleanup_error.is_none());
        assert_eq!(lifecycle.state().await, LifecycleState::Activated);
        assert_eq!(
            storage.names().await.unwrap(),
            vec!["pagekeeper-v1", "unrelated-v0"]
        );
    }

    #[tokio::test]
    async fn test_activate_fails_when_claim_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let network = FakeNetwork::serving(&[("/", 200), ("/index.html", 200)]);
        let lifecycle = LifecycleController::new(config("v1"), storage, network, Arc::new(RejectingClients));

        lifecycle.install().await.unwrap();
        assert!(matches!(
            lifecycle.activate().await,
            Err(AgentError::Host(HostError::ClaimRejected(_)))
        ));
        assert_eq!(lifecycle.state().await, LifecycleState::Activating);
    }

    #[tokio::test]
    async fn test_activate_before_install_is_refused() {
        let storage = Arc::new(MemoryStorage::new());
        storage.open("pagekeeper-v0").await.unwrap();
        let clients = Arc::new(LocalClients::new());
        clients.register("tab-1", "https://tools.example.com/").await;
        let lifecycle = controller("v1", Arc::clone(&storage), FakeNetwork::serving(&[]), clients);

        assert!(matches!(
            lifecycle.activate().await,
            Err(AgentError::InvalidState {
                from: LifecycleState::Parsed,
                to: LifecycleState::Activating,
            })
        ));
        assert_eq!(lifecycle.state().await, LifecycleState::Parsed);
        assert_eq!(storage.names().await.unwrap(), vec!["pagekeeper-v0"]);
    }

    #[tokio::test]
    async fn test_activate_after_failed_install_is_refused() {
        let storage = Arc::new(MemoryStorage::new());
        storage.open("pagekeeper-v0").await.unwrap();
        let network = FakeNetwork::serving(&[("/", 200)]);
        let lifecycle = controller("v1", Arc::clone(&storage), network, Arc::new(LocalClients::new()));

        assert!(lifecycle.install().await.is_err());
        assert!(matches!(
            lifecycle.activate().await,
            Err(AgentError::InvalidState {
                from: LifecycleState::Redundant,
                ..
            })
        ));
        assert_eq!(lifecycle.state().await, LifecycleState::Redundant);
        assert!(storage.has("pagekeeper-v0").await.unwrap());
    }

    #[tokio::test]
    async fn test_activate_again_is_allowed() {
        let storage = Arc::new(MemoryStorage::new());
        let network = FakeNetwork::serving(&[("/", 200), ("/index.html", 200)]);
        let lifecycle = controller("v1", storage, network, Arc::new(LocalClients::new()));

        lifecycle.install().await.unwrap();
        lifecycle.activate().await.unwrap();
        lifecycle.activate().await.unwrap();
        assert_eq!(lifecycle.state().await, LifecycleState::Activated);
    }

    #[tokio::test]
    async fn test_get_version_replies() {
        let lifecycle = controller(
            "v1.0.1",
            Arc::new(MemoryStorage::new()),
            FakeNetwork::serving(&[]),
            Arc::new(LocalClients::new()),
        );
        let (message, rx) = ChannelMessage::with_reply(Command::GetVersion);
        lifecycle.handle_message(message).await.unwrap();
        assert_eq!(
            rx.await.unwrap(),
            Reply::Version {
                version: "v1.0.1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_clear_cache_removes_all_owned() {
        let storage = Arc::new(MemoryStorage::new());
        for name in ["pagekeeper-v0", "pagekeeper-v1", "unrelated-v0"] {
            storage.open(name).await.unwrap();
        }
        let lifecycle = controller(
            "v1",
            Arc::clone(&storage),
            FakeNetwork::serving(&[]),
            Arc::new(LocalClients::new()),
        );

        let (message, rx) = ChannelMessage::with_reply(Command::ClearCache);
        lifecycle.handle_message(message).await.unwrap();
        assert_eq!(rx.await.unwrap(), Reply::CacheCleared);
        assert_eq!(storage.names().await.unwrap(), vec!["unrelated-v0"]);
    }

    #[tokio::test]
    async fn test_skip_waiting_signals_host() {
        let clients = Arc::new(LocalClients::new());
        let lifecycle = controller(
            "v1",
            Arc::new(MemoryStorage::new()),
            FakeNetwork::serving(&[]),
            Arc::clone(&clients),
        );
        lifecycle
            .handle_message(ChannelMessage::new(Command::SkipWaiting))
            .await
            .unwrap();
        assert!(clients.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_unrecognized_command_is_ignored() {
        let lifecycle = controller(
            "v1",
            Arc::new(MemoryStorage::new()),
            FakeNetwork::serving(&[]),
            Arc::new(LocalClients::new()),
        );
        let (message, rx) = ChannelMessage::with_reply(Command::Unrecognized("PING".to_string()));
        lifecycle.handle_message(message).await.unwrap();
        assert_eq!(lifecycle.state().await, LifecycleState::Parsed);
        // No reply is sent; the port is simply dropped
        assert!(rx.await.is_err());
    }
}
