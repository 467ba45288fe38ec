use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Unique identifier for one call attempt, generated by the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random 32-character uppercase hex id.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id: String = (0..32)
            .map(|_| HEX_UPPER[rng.random_range(0..16)] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device/user identifier as used in signaling addressing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Which side of a call this device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    Initiator,
    Responder,
}

/// Media kind requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

/// The caller/callee pair for one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participants {
    pub caller: DeviceId,
    pub callee: DeviceId,
}

/// Why a call reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up an active call.
    UserHangUp,
    /// The remote side sent end-call.
    RemoteEnded,
    /// The callee declined, or we declined an incoming call.
    Declined,
    /// Incoming call was never answered within the ring window.
    RingTimeout,
    /// Outgoing offer got no response within the offer window.
    OfferTimeout,
    /// The transport never reported connected within the connect window.
    ConnectTimeout,
    /// The transport reported a connection failure.
    TransportFailed,
    /// Signaling could not be delivered to the relay.
    RelayUnavailable,
}

impl EndReason {
    /// The history bucket this reason falls into.
    pub fn outcome(&self) -> CallOutcome {
        match self {
            Self::UserHangUp | Self::RemoteEnded => CallOutcome::Completed,
            Self::Declined
            | Self::RingTimeout
            | Self::OfferTimeout
            | Self::ConnectTimeout
            | Self::TransportFailed
            | Self::RelayUnavailable => CallOutcome::Failed,
        }
    }

    /// Short human-readable text for surfacing a failed call to the user.
    /// Never a raw diagnostic.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::UserHangUp | Self::RemoteEnded => "Call ended",
            Self::Declined => "Call declined",
            Self::RingTimeout => "Missed call",
            Self::OfferTimeout => "No answer",
            Self::ConnectTimeout | Self::TransportFailed => "Couldn't connect the call",
            Self::RelayUnavailable => "Couldn't reach the calling service",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::UserHangUp => "user_hang_up",
            Self::RemoteEnded => "remote_ended",
            Self::Declined => "declined",
            Self::RingTimeout => "ring_timeout",
            Self::OfferTimeout => "offer_timeout",
            Self::ConnectTimeout => "connect_timeout",
            Self::TransportFailed => "transport_failed",
            Self::RelayUnavailable => "relay_unavailable",
        };
        f.write_str(tag)
    }
}

/// Terminal outcome bucket recorded in call history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    Failed,
}

/// Basic metadata attached to call events handed to the surrounding app.
#[derive(Debug, Clone)]
pub struct BasicCallMeta {
    pub call_id: CallId,
    pub peer: DeviceId,
    pub kind: CallKind,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_32_hex() {
        let id = CallId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(
            id.as_str()
                .chars()
                .all(|c| !c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_end_reason_outcomes() {
        assert_eq!(EndReason::UserHangUp.outcome(), CallOutcome::Completed);
        assert_eq!(EndReason::RemoteEnded.outcome(), CallOutcome::Completed);
        assert_eq!(EndReason::Declined.outcome(), CallOutcome::Failed);
        assert_eq!(EndReason::RingTimeout.outcome(), CallOutcome::Failed);
        assert_eq!(EndReason::TransportFailed.outcome(), CallOutcome::Failed);
    }

    #[test]
    fn test_user_messages_are_not_diagnostics() {
        // Surfaced text must be short and free of internal jargon.
        for reason in [
            EndReason::UserHangUp,
            EndReason::Declined,
            EndReason::RingTimeout,
            EndReason::ConnectTimeout,
            EndReason::RelayUnavailable,
        ] {
            let msg = reason.user_message();
            assert!(!msg.is_empty());
            assert!(!msg.contains("Error"));
        }
    }

    #[test]
    fn test_call_id_serde_is_transparent() {
        let id = CallId::new("AC90CFD09DF712D981142B172706F9F2");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"AC90CFD09DF712D981142B172706F9F2\"");
    }
}
