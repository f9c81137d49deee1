//! Command channel between the pages and the agent.
//!
//! Inbound messages are JSON objects `{"type": "...", "data": ...}`. The
//! recognised types are `SKIP_WAITING`, `GET_VERSION` and `CLEAR_CACHE`;
//! anything else parses to `Command::Unrecognized` and is only logged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

pub const SKIP_WAITING: &str = "SKIP_WAITING";
pub const GET_VERSION: &str = "GET_VERSION";
pub const CLEAR_CACHE: &str = "CLEAR_CACHE";

/// Raw message as posted by a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Promote the waiting generation without the grace period
    SkipWaiting,
    GetVersion,
    /// Delete every cache generation the agent owns
    ClearCache,
    Unrecognized(String),
}

impl Command {
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            SKIP_WAITING => Command::SkipWaiting,
            GET_VERSION => Command::GetVersion,
            CLEAR_CACHE => Command::ClearCache,
            other => Command::Unrecognized(other.to_string()),
        }
    }

    /// Parse a posted JSON value. Values without a string `type` are
    /// unrecognised rather than errors.
    pub fn from_value(value: &Value) -> Self {
        match serde_json::from_value::<InboundMessage>(value.clone()) {
            Ok(message) => Self::from_kind(&message.kind),
            Err(e) => {
                debug!(error = %e, "Message without a type");
                Command::Unrecognized(value.to_string())
            }
        }
    }
}

impl From<&InboundMessage> for Command {
    fn from(message: &InboundMessage) -> Self {
        Command::from_kind(&message.kind)
    }
}

/// Reply posted back on the message's reply port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type")]
pub enum Reply {
    #[serde(rename = "VERSION")]
    Version { version: String },
    #[serde(rename = "CACHE_CLEARED")]
    CacheCleared,
}

/// A command plus the optional port its reply goes to.
#[derive(Debug)]
pub struct ChannelMessage {
    pub command: Command,
    pub reply: Option<oneshot::Sender<Reply>>,
}

impl ChannelMessage {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            reply: None,
        }
    }

    /// Attach a reply port and return the receiving end.
    pub fn with_reply(command: Command) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }

    pub fn from_value(value: &Value) -> Self {
        Self::new(Command::from_value(value))
    }
}
