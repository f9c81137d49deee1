//! pagekeeper - offline caching agent for a small static web app.
//!
//! The agent keeps one versioned cache generation current, serves cached
//! assets first while refreshing them in the background, falls back to the
//! cached home document for offline navigations, and answers a small command
//! protocol from the pages it controls.
//!
//! The host (browser runtime, embedding server, test harness) owns the
//! actual event loop and passes events into [`Agent::dispatch`]:
//!
//! ```ignore
//! let config = AgentConfig::load(Path::new("pagekeeper.json"))?;
//! let network = HttpNetwork::from_config(&config)?;
//! let agent = Agent::new(
//!     config,
//!     Arc::new(DiskStorage::default_location()?),
//!     Arc::new(network),
//!     Arc::new(LocalClients::new()),
//! )?;
//! agent.dispatch(Event::Install).await?;
//! agent.dispatch(Event::Activate).await?;
//! ```

pub mod agent;
pub mod classifier;
pub mod config;
pub mod error;
pub mod generation;
pub mod host;
pub mod http;
pub mod lifecycle;
pub mod message;
pub mod network;
pub mod store;
pub mod strategy;
pub mod telemetry;

pub use agent::{Agent, Event, Outcome};
pub use classifier::{RequestClassifier, Verdict};
pub use config::{AgentConfig, ExclusionRule};
pub use error::{AgentError, AgentResult, FetchError, HostError, StoreError};
pub use generation::{CleanupReport, GenerationManager};
pub use host::{ClientInfo, ClientRegistry, LocalClients};
pub use http::{Method, Request, RequestKey, RequestMode, Response};
pub use lifecycle::{ActivationReport, InstallReport, LifecycleController, LifecycleState};
pub use message::{ChannelMessage, Command, InboundMessage, Reply};
pub use network::{HttpNetwork, Network};
pub use store::{Cache, CacheStorage, DiskStorage, MemoryStorage, StoredResponse};
pub use strategy::{RefreshOutcome, RefreshResult, StrategyEngine};
pub use telemetry::init_tracing;
