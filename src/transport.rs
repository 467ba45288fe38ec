//! Peer transport capability seam.
//!
//! The call core never talks to a concrete media engine. The surrounding app
//! supplies a [`PeerTransport`] for whatever runtime it embeds (a browser
//! peer connection, a native WebRTC stack); the core drives it through these
//! traits and reacts to its events. Tests use in-memory mocks.

use async_trait::async_trait;
use kincore::types::{CallKind, ConnectionType, TransportStats};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::calls::signaling::{IceCandidate, SessionDescription};
use crate::traversal::TraversalServerConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport failed: {0}")]
    Failed(String),

    #[error("transport session closed")]
    Closed,

    #[error("timed out establishing connection")]
    Timeout,
}

/// A live media track handed to the renderer.
pub trait MediaTrack: Send + Sync {
    /// Whether the underlying source is still producing data.
    fn is_live(&self) -> bool;
    /// Whether the track is enabled (not muted at the source).
    fn is_enabled(&self) -> bool;
}

/// Events surfaced by a live peer session.
#[derive(Clone)]
pub enum TransportEvent {
    /// A local traversal candidate to relay to the peer.
    LocalCandidate(IceCandidate),
    /// The connection reached connected state.
    Connected,
    /// Establishment failed, or an established connection broke down.
    Failed(String),
    /// The connection dropped after being established.
    Disconnected,
    /// A remote media track became available for rendering.
    TrackAdded(Arc<dyn MediaTrack>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::Connected => f.write_str("Connected"),
            Self::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::TrackAdded(_) => f.write_str("TrackAdded"),
        }
    }
}

/// Factory for peer sessions.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Open a new peer session for one call attempt. The server list is
    /// immutable for the lifetime of the session.
    async fn open(
        &self,
        servers: Vec<TraversalServerConfig>,
        kind: CallKind,
    ) -> Result<Arc<dyn PeerSession>, TransportError>;
}

/// One live peer connection.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Take the session's event stream. Yields `None` after the first call.
    async fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Current transport statistics for quality sampling.
    async fn stats(&self) -> Result<TransportStats, TransportError>;

    /// Coarse network hint, when the platform can provide one.
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Unknown
    }

    /// Enable or disable outgoing video (audio-only fallback).
    async fn set_video_enabled(&self, enabled: bool) -> Result<(), TransportError>;

    async fn close(&self);
}
