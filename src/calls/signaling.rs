//! Call signaling vocabulary and wire unit.
//!
//! One [`SignalingMessage`] per action, JSON-serialized and broadcast on the
//! family channel. Timestamps are advisory only: processing reacts to the
//! logical action and current state, never to wall-clock order.

use chrono::{DateTime, Utc};
use kincore::channel::ChannelName;
use kincore::types::{CallId, CallKind, DeviceId, EndReason};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::CallError;

/// Signaling actions used for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingAction {
    /// Proposes a new call; carries the call kind.
    CallRequest,
    /// Callee accepted; the caller proceeds to send its offer.
    CallAccepted,
    /// Callee declined or timed out.
    CallRejected,
    /// Caller's connection offer (session description).
    Offer,
    /// Callee's connection answer (session description).
    Answer,
    /// One traversal candidate.
    IceCandidate,
    /// Either side terminating.
    EndCall,
}

impl SignalingAction {
    /// All actions in wire order.
    pub const ALL: [SignalingAction; 7] = [
        Self::CallRequest,
        Self::CallAccepted,
        Self::CallRejected,
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
        Self::EndCall,
    ];

    /// Wire tag for this action.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::CallRequest => "call-request",
            Self::CallAccepted => "call-accepted",
            Self::CallRejected => "call-rejected",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::EndCall => "end-call",
        }
    }

    /// Parse from a wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "call-request" => Some(Self::CallRequest),
            "call-accepted" => Some(Self::CallAccepted),
            "call-rejected" => Some(Self::CallRejected),
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            "end-call" => Some(Self::EndCall),
            _ => None,
        }
    }

    /// Whether this action can move the call state machine. Candidates are
    /// media plumbing and never change state by themselves.
    pub const fn is_critical(&self) -> bool {
        !matches!(self, Self::IceCandidate)
    }
}

impl fmt::Display for SignalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// A session description produced by the peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer", as produced by the transport.
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// One proposed network path a peer offers as a way to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate string, e.g.
    /// "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host".
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// The wire unit exchanged over the relay, one per action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub action: SignalingAction,
    pub call_id: CallId,
    pub from: DeviceId,
    pub to: DeviceId,
    /// Family-scoped channel name. Derived, never user-supplied raw.
    pub channel: ChannelName,
    /// Call kind, present on call-request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_kind: Option<CallKind>,
    /// Session description, present on offer/answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    /// Candidate, present on ice-candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    /// Advisory end reason on call-rejected/end-call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EndReason>,
    /// Issuer-side wall clock at emission. Audit/debugging only; never used
    /// for ordering.
    pub timestamp: DateTime<Utc>,
}

impl SignalingMessage {
    fn base(
        action: SignalingAction,
        call_id: CallId,
        from: DeviceId,
        to: DeviceId,
        channel: ChannelName,
    ) -> Self {
        Self {
            action,
            call_id,
            from,
            to,
            channel,
            call_kind: None,
            description: None,
            candidate: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn call_request(
        call_id: CallId,
        from: DeviceId,
        to: DeviceId,
        channel: ChannelName,
        kind: CallKind,
    ) -> Self {
        let mut msg = Self::base(SignalingAction::CallRequest, call_id, from, to, channel);
        msg.call_kind = Some(kind);
        msg
    }

    pub fn call_accepted(
        call_id: CallId,
        from: DeviceId,
        to: DeviceId,
        channel: ChannelName,
    ) -> Self {
        Self::base(SignalingAction::CallAccepted, call_id, from, to, channel)
    }

    pub fn call_rejected(
        call_id: CallId,
        from: DeviceId,
        to: DeviceId,
        channel: ChannelName,
        reason: EndReason,
    ) -> Self {
        let mut msg = Self::base(SignalingAction::CallRejected, call_id, from, to, channel);
        msg.reason = Some(reason);
        msg
    }

    pub fn offer(
        call_id: CallId,
        from: DeviceId,
        to: DeviceId,
        channel: ChannelName,
        description: SessionDescription,
    ) -> Self {
        let mut msg = Self::base(SignalingAction::Offer, call_id, from, to, channel);
        msg.description = Some(description);
        msg
    }

    pub fn answer(
        call_id: CallId,
        from: DeviceId,
        to: DeviceId,
        channel: ChannelName,
        description: SessionDescription,
    ) -> Self {
        let mut msg = Self::base(SignalingAction::Answer, call_id, from, to, channel);
        msg.description = Some(description);
        msg
    }

    pub fn ice_candidate(
        call_id: CallId,
        from: DeviceId,
        to: DeviceId,
        channel: ChannelName,
        candidate: IceCandidate,
    ) -> Self {
        let mut msg = Self::base(SignalingAction::IceCandidate, call_id, from, to, channel);
        msg.candidate = Some(candidate);
        msg
    }

    pub fn end_call(
        call_id: CallId,
        from: DeviceId,
        to: DeviceId,
        channel: ChannelName,
        reason: EndReason,
    ) -> Self {
        let mut msg = Self::base(SignalingAction::EndCall, call_id, from, to, channel);
        msg.reason = Some(reason);
        msg
    }

    /// Check action-specific required fields. Messages failing this are
    /// skipped by the receiver, never processed partially.
    pub fn validate(&self) -> Result<(), CallError> {
        match self.action {
            SignalingAction::CallRequest if self.call_kind.is_none() => {
                Err(CallError::MissingField("callType"))
            }
            SignalingAction::Offer | SignalingAction::Answer if self.description.is_none() => {
                Err(CallError::MissingField("data.description"))
            }
            SignalingAction::IceCandidate if self.candidate.is_none() => {
                Err(CallError::MissingField("data.candidate"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kincore::channel::family_channel;

    fn ids() -> (CallId, DeviceId, DeviceId, ChannelName) {
        (
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            DeviceId::from("guardian-1"),
            DeviceId::from("child-1"),
            family_channel("fam1"),
        )
    }

    #[test]
    fn test_action_tag_roundtrip() {
        for action in SignalingAction::ALL {
            let parsed = SignalingAction::from_tag(action.tag_name()).unwrap();
            assert_eq!(action, parsed, "failed roundtrip for {action:?}");
        }
        assert!(SignalingAction::from_tag("mute").is_none());
    }

    #[test]
    fn test_tags_match_wire_vocabulary() {
        assert_eq!(SignalingAction::CallRequest.tag_name(), "call-request");
        assert_eq!(SignalingAction::CallAccepted.tag_name(), "call-accepted");
        assert_eq!(SignalingAction::CallRejected.tag_name(), "call-rejected");
        assert_eq!(SignalingAction::Offer.tag_name(), "offer");
        assert_eq!(SignalingAction::Answer.tag_name(), "answer");
        assert_eq!(SignalingAction::IceCandidate.tag_name(), "ice-candidate");
        assert_eq!(SignalingAction::EndCall.tag_name(), "end-call");
    }

    #[test]
    fn test_serde_uses_kebab_case_tags() {
        let (id, from, to, ch) = ids();
        let msg = SignalingMessage::call_request(id, from, to, ch, CallKind::Video);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"action\":\"call-request\""));
        assert!(json.contains("\"call_kind\":\"video\""));
        let back: SignalingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_critical_actions() {
        assert!(SignalingAction::Offer.is_critical());
        assert!(SignalingAction::EndCall.is_critical());
        assert!(!SignalingAction::IceCandidate.is_critical());
    }

    #[test]
    fn test_required_fields_are_validated() {
        let (id, from, to, ch) = ids();
        let mut msg = SignalingMessage::offer(
            id.clone(),
            from.clone(),
            to.clone(),
            ch.clone(),
            SessionDescription::offer("v=0"),
        );
        assert!(msg.validate().is_ok());
        msg.description = None;
        assert!(msg.validate().is_err());

        let mut req = SignalingMessage::call_request(id, from, to, ch, CallKind::Voice);
        assert!(req.validate().is_ok());
        req.call_kind = None;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_builders_fill_action_payloads() {
        let (id, from, to, ch) = ids();
        let cand = IceCandidate::new("candidate:1 1 UDP 2130706431 10.0.0.2 9 typ host");
        let msg = SignalingMessage::ice_candidate(id, from, to, ch, cand.clone());
        assert_eq!(msg.action, SignalingAction::IceCandidate);
        assert_eq!(msg.candidate, Some(cand));
        assert!(msg.description.is_none());
        assert!(msg.validate().is_ok());
    }
}
