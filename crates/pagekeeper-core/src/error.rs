use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Result alias used across the agent.
pub type AgentResult<T> = Result<T, AgentError>;

/// Failure of the network fetch primitive.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unsupported request method: {0}")]
    UnsupportedMethod(String),
}

/// Failure inside the persistent cache store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cache storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache '{name}' is corrupt: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid cache name: {0}")]
    InvalidName(String),

    #[error("Cache storage unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by the host page registry.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Cannot claim clients: {0}")]
    ClaimRejected(String),
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("Asset {url} returned status {status}")]
    AssetStatus { url: String, status: u16 },

    #[error("Invalid asset path '{path}': {reason}")]
    InvalidAssetPath { path: String, reason: String },

    #[error("Offline and no cached substitute for {url}: {source}")]
    Offline {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("Failed to delete caches: {}", .failed.join(", "))]
    Cleanup { failed: Vec<String> },

    #[error("Cannot move from {from} to {to}")]
    InvalidState {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Maximum length for error text carried in refresh reports
const MAX_ERROR_TEXT_LENGTH: usize = 300;

impl AgentError {
    /// True when the error came from the network rather than the store.
    pub fn is_network(&self) -> bool {
        matches!(self, AgentError::Fetch(_) | AgentError::Offline { .. })
    }
}

/// Truncate an error message to avoid logging excessive data
pub(crate) fn truncate_error(text: &str) -> String {
    if text.len() <= MAX_ERROR_TEXT_LENGTH {
        return text.to_string();
    }
    let mut end = MAX_ERROR_TEXT_LENGTH;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &text[..end], text.len())
}
