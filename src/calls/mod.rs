//! Real-time call orchestration.
//!
//! This module is the core of the calling subsystem:
//!
//! - [`SignalingAction`] & [`SignalingMessage`]: the wire vocabulary relayed
//!   between family devices
//! - [`CallState`] & [`CallSession`]: the call lifecycle state machine
//! - [`CallManager`]: the coordinator owning the single live session
//! - [`ConnectionHealthMonitor`]: media recovery while a call is live
//! - [`NetworkQualityController`]: quality sampling and video suppression
//! - [`CallLedger`]: call history and badge counters
//!
//! # Protocol Overview
//!
//! A caller publishes `call-request` on the family channel; the callee rings
//! and answers with `call-accepted` (or `call-rejected`), after which the
//! sides exchange `offer`/`answer` descriptions and `ice-candidate`s until
//! the transport connects. Either side terminates with `end-call`. The relay
//! is at-least-once and unordered, so every handler is idempotent and
//! candidates may overtake descriptions.

#[cfg(test)]
mod coordinator_tests;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod monitor;
pub mod quality;
pub mod signaling;
pub mod state;

pub use error::CallError;
pub use ledger::{BadgeCounters, CallLedger, CallRecord, LedgerConfig};
pub use manager::{CallManager, CallManagerConfig};
pub use monitor::{
    ConnectionHealthMonitor, HealthState, MediaRenderer, MonitorConfig, PlaybackError, Readiness,
    RendererEvent,
};
pub use quality::{NetworkQualityController, QualityControllerConfig, QualityObservation};
pub use signaling::{IceCandidate, SessionDescription, SignalingAction, SignalingMessage};
pub use state::{CallSession, CallState, CallTransition, InvalidTransition};
