//! Signaling relay adapter.
//!
//! Wraps the external pub/sub relay into a typed send/receive interface
//! scoped to a family channel. Delivery is at-least-once and unordered
//! across message types; consumers must be idempotent to replays and
//! resilient to reordering. Publish failures are surfaced as
//! [`RelayError::Unavailable`] rather than silently dropped, since a lost offer
//! or end-call leaves the other side stale until a local timeout fires.

pub mod memory;
pub mod ws;

use crate::calls::signaling::SignalingMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kincore::channel::ChannelName;
use kincore::types::DeviceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::InMemoryRelay;
pub use ws::{WebSocketRelay, WebSocketRelayConfig};

#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay cannot be reached or refused the publish.
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("not subscribed to channel: {0}")]
    NotSubscribed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// A family text message observed on the channel.
///
/// The call core only uses these to drive badge counters; rendering and
/// storage of conversation content is the surrounding app's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: DeviceId,
    pub to: DeviceId,
    pub channel: ChannelName,
    /// Conversation key, e.g. the child's device id.
    pub conversation: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Wire unit broadcast on a family channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Signaling(SignalingMessage),
    Chat(ChatMessage),
    /// Forward compatibility: payload kinds this client does not know are
    /// skipped, not errored.
    #[serde(other)]
    Unknown,
}

/// One delivered envelope, with the relay's own receive timestamp when the
/// service provides one. Advisory only, never used for ordering.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub server_ts: Option<DateTime<Utc>>,
}

/// Typed pub/sub access to the signaling relay.
///
/// Implementations must not assume exactly-once or ordered delivery; the
/// relay may duplicate and reorder freely.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Subscribe to a channel. The returned receiver yields every envelope
    /// published to the channel, including the subscriber's own.
    async fn subscribe(&self, channel: &ChannelName) -> Result<mpsc::Receiver<Delivery>>;

    /// Publish an envelope to a channel.
    async fn publish(&self, channel: &ChannelName, envelope: Envelope) -> Result<()>;
}
