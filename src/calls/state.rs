//! Call state machine implementation.
//!
//! The state machine is the authoritative model of one call attempt. All
//! mutation goes through discrete transitions: [`CallState::apply`] returns a
//! new state snapshot and rejects invalid pairs, which keeps the lifecycle
//! invariants mechanically checkable. Exactly one non-terminal session exists
//! per device; that invariant is enforced by the coordinator owning the
//! session, not by the transport.

use chrono::{DateTime, Utc};
use kincore::channel::ChannelName;
use kincore::types::{
    CallId, CallKind, CallOutcome, CallRole, DeviceId, EndReason, NetworkQualityState,
    Participants,
};
use serde::Serialize;

use super::signaling::IceCandidate;

/// Current state of a call.
#[derive(Debug, Clone, Serialize)]
pub enum CallState {
    /// Outgoing call: request sent, waiting for the callee.
    Offering { requested_at: DateTime<Utc> },
    /// Incoming call: ringing locally.
    Ringing { received_at: DateTime<Utc> },
    /// Incoming call: locally accepted, preparing the local description.
    Answering { accepted_at: DateTime<Utc> },
    /// Both sides committed, waiting for the transport to connect.
    Connecting { since: DateTime<Utc> },
    /// Call active with media flowing.
    Active {
        connected_at: DateTime<Utc>,
        audio_muted: bool,
        video_off: bool,
    },
    /// Call ended.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    /// Only RINGING may consume an incoming call. Concurrent dismiss/answer
    /// races resolve here, not via auxiliary flags.
    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// Apply a transition, returning the new state snapshot.
    pub fn apply(&self, transition: &CallTransition) -> Result<CallState, InvalidTransition> {
        let video_on_connect = |kind: CallKind| kind != CallKind::Video;
        let ended = |reason: EndReason| CallState::Ended {
            reason,
            ended_at: Utc::now(),
            duration_secs: None,
        };
        let ended_from_active = |connected_at: &DateTime<Utc>, reason: EndReason| {
            let duration = Utc::now().signed_duration_since(*connected_at).num_seconds();
            CallState::Ended {
                reason,
                ended_at: Utc::now(),
                duration_secs: Some(duration),
            }
        };

        let new_state = match (self, transition) {
            // Outgoing leg.
            (CallState::Offering { .. }, CallTransition::RemoteAccepted)
            | (CallState::Offering { .. }, CallTransition::RemoteAnswered) => {
                CallState::Connecting { since: Utc::now() }
            }
            (CallState::Offering { .. }, CallTransition::RemoteRejected { reason }) => {
                ended(*reason)
            }
            (CallState::Offering { .. }, CallTransition::OfferTimeout) => {
                ended(EndReason::OfferTimeout)
            }
            (CallState::Offering { .. }, CallTransition::LocalHangUp) => {
                ended(EndReason::UserHangUp)
            }
            (CallState::Offering { .. }, CallTransition::TransportFailed { reason }) => {
                ended(*reason)
            }

            // Incoming leg.
            (CallState::Ringing { .. }, CallTransition::LocalAccepted) => {
                CallState::Answering {
                    accepted_at: Utc::now(),
                }
            }
            (CallState::Ringing { .. }, CallTransition::LocalRejected { reason }) => {
                ended(*reason)
            }
            (CallState::Ringing { .. }, CallTransition::RingTimeout) => {
                ended(EndReason::RingTimeout)
            }
            (CallState::Ringing { .. }, CallTransition::RemoteEnded) => {
                ended(EndReason::RemoteEnded)
            }
            (CallState::Answering { .. }, CallTransition::LocalDescriptionSent) => {
                CallState::Connecting { since: Utc::now() }
            }
            (CallState::Answering { .. }, CallTransition::RemoteEnded) => {
                ended(EndReason::RemoteEnded)
            }
            (CallState::Answering { .. }, CallTransition::ConnectTimeout) => {
                ended(EndReason::ConnectTimeout)
            }
            (CallState::Answering { .. }, CallTransition::TransportFailed { reason }) => {
                ended(*reason)
            }
            (CallState::Answering { .. }, CallTransition::LocalHangUp) => {
                ended(EndReason::UserHangUp)
            }

            // Establishment.
            (CallState::Connecting { .. }, CallTransition::TransportConnected { kind }) => {
                CallState::Active {
                    connected_at: Utc::now(),
                    audio_muted: false,
                    video_off: video_on_connect(*kind),
                }
            }
            // A replayed or late answer while already connecting is absorbed.
            (CallState::Connecting { since }, CallTransition::RemoteAnswered) => {
                CallState::Connecting { since: *since }
            }
            (CallState::Connecting { .. }, CallTransition::ConnectTimeout) => {
                ended(EndReason::ConnectTimeout)
            }
            (CallState::Connecting { .. }, CallTransition::TransportFailed { reason }) => {
                ended(*reason)
            }
            (CallState::Connecting { .. }, CallTransition::RemoteEnded) => {
                ended(EndReason::RemoteEnded)
            }
            (CallState::Connecting { .. }, CallTransition::RemoteRejected { reason }) => {
                ended(*reason)
            }
            (CallState::Connecting { .. }, CallTransition::LocalHangUp) => {
                ended(EndReason::UserHangUp)
            }

            // Live call.
            (CallState::Active { connected_at, .. }, CallTransition::LocalHangUp) => {
                ended_from_active(connected_at, EndReason::UserHangUp)
            }
            (CallState::Active { connected_at, .. }, CallTransition::RemoteEnded) => {
                ended_from_active(connected_at, EndReason::RemoteEnded)
            }
            (
                CallState::Active { connected_at, .. },
                CallTransition::TransportFailed { reason },
            ) => ended_from_active(connected_at, *reason),
            (
                CallState::Active {
                    connected_at,
                    video_off,
                    ..
                },
                CallTransition::AudioMuteChanged { muted },
            ) => CallState::Active {
                connected_at: *connected_at,
                audio_muted: *muted,
                video_off: *video_off,
            },
            (
                CallState::Active {
                    connected_at,
                    audio_muted,
                    ..
                },
                CallTransition::VideoStateChanged { off },
            ) => CallState::Active {
                connected_at: *connected_at,
                audio_muted: *audio_muted,
                video_off: *off,
            },

            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        Ok(new_state)
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Remote call-accepted; caller proceeds toward the media exchange.
    RemoteAccepted,
    /// Remote answer applied. On OFFERING this implies acceptance; the
    /// relay may deliver the answer before (or instead of) call-accepted.
    RemoteAnswered,
    RemoteRejected { reason: EndReason },
    LocalAccepted,
    LocalRejected { reason: EndReason },
    LocalDescriptionSent,
    RingTimeout,
    OfferTimeout,
    ConnectTimeout,
    TransportConnected { kind: CallKind },
    TransportFailed { reason: EndReason },
    LocalHangUp,
    RemoteEnded,
    AudioMuteChanged { muted: bool },
    VideoStateChanged { off: bool },
}

/// Full session information for one call attempt.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub id: CallId,
    pub role: CallRole,
    pub participants: Participants,
    pub channel: ChannelName,
    pub kind: CallKind,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    /// Set exactly once, on the terminal transition.
    pub ended_at: Option<DateTime<Utc>>,
    /// Last known quality picture, retained for post-call diagnostics.
    pub quality: NetworkQualityState,
    /// True once the call has ever been Active.
    pub answered: bool,
    /// Candidates that arrived before the remote description was applied.
    /// Flushed in arrival order immediately after it is.
    #[serde(skip)]
    pub pending_candidates: Vec<IceCandidate>,
    #[serde(skip)]
    pub remote_description_applied: bool,
    /// Guards the exactly-once emission of our terminal signaling message.
    #[serde(skip)]
    pub end_signal_sent: bool,
}

impl CallSession {
    pub fn new_outgoing(
        id: CallId,
        caller: DeviceId,
        callee: DeviceId,
        channel: ChannelName,
        kind: CallKind,
    ) -> Self {
        Self {
            id,
            role: CallRole::Initiator,
            participants: Participants { caller, callee },
            channel,
            kind,
            state: CallState::Offering {
                requested_at: Utc::now(),
            },
            started_at: Utc::now(),
            ended_at: None,
            quality: NetworkQualityState::default(),
            answered: false,
            pending_candidates: Vec::new(),
            remote_description_applied: false,
            end_signal_sent: false,
        }
    }

    pub fn new_incoming(
        id: CallId,
        caller: DeviceId,
        callee: DeviceId,
        channel: ChannelName,
        kind: CallKind,
    ) -> Self {
        Self {
            id,
            role: CallRole::Responder,
            participants: Participants { caller, callee },
            channel,
            kind,
            state: CallState::Ringing {
                received_at: Utc::now(),
            },
            started_at: Utc::now(),
            ended_at: None,
            quality: NetworkQualityState::default(),
            answered: false,
            pending_candidates: Vec::new(),
            remote_description_applied: false,
            end_signal_sent: false,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.role == CallRole::Initiator
    }

    /// The other device on this call.
    pub fn peer(&self) -> &DeviceId {
        match self.role {
            CallRole::Initiator => &self.participants.callee,
            CallRole::Responder => &self.participants.caller,
        }
    }

    /// Our own device on this call.
    pub fn local(&self) -> &DeviceId {
        match self.role {
            CallRole::Initiator => &self.participants.caller,
            CallRole::Responder => &self.participants.callee,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_ended()
    }

    /// Apply a state transition. Returns error if the transition is invalid
    /// for the current state; the session is unchanged in that case.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = self.state.apply(&transition)?;
        if let CallState::Active { .. } = new_state {
            self.answered = true;
        }
        if let CallState::Ended { ended_at, .. } = &new_state
            && self.ended_at.is_none()
        {
            self.ended_at = Some(*ended_at);
        }
        self.state = new_state;
        Ok(())
    }

    /// Terminal reason, once ended.
    pub fn end_reason(&self) -> Option<EndReason> {
        match &self.state {
            CallState::Ended { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<CallOutcome> {
        self.end_reason().map(|r| r.outcome())
    }

    /// Queue a candidate that arrived before the remote description.
    pub fn queue_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    /// Take all queued candidates, in arrival order.
    pub fn drain_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use kincore::channel::family_channel;

    fn make_outgoing_call() -> CallSession {
        CallSession::new_outgoing(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            DeviceId::from("guardian-1"),
            DeviceId::from("child-1"),
            family_channel("fam1"),
            CallKind::Voice,
        )
    }

    fn make_incoming_call() -> CallSession {
        CallSession::new_incoming(
            CallId::new("BC5BD1EDE9BBE601F408EF3795479E93"),
            DeviceId::from("guardian-1"),
            DeviceId::from("child-1"),
            family_channel("fam1"),
            CallKind::Video,
        )
    }

    /// Flow: Offering → Connecting → Active → Ended.
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = make_outgoing_call();

        assert!(matches!(call.state, CallState::Offering { .. }));

        call.apply_transition(CallTransition::RemoteAccepted).unwrap();
        assert!(call.state.is_connecting());

        call.apply_transition(CallTransition::RemoteAnswered).unwrap();
        assert!(call.state.is_connecting());

        call.apply_transition(CallTransition::TransportConnected {
            kind: CallKind::Voice,
        })
        .unwrap();
        assert!(call.state.is_active());
        assert!(call.answered);

        call.apply_transition(CallTransition::LocalHangUp).unwrap();
        assert!(call.state.is_ended());
        assert_eq!(call.end_reason(), Some(EndReason::UserHangUp));
        assert!(call.ended_at.is_some());

        if let CallState::Ended { duration_secs, .. } = call.state {
            assert!(duration_secs.is_some());
        }
    }

    /// Flow: Ringing → Answering → Connecting → Active → Ended.
    #[test]
    fn test_incoming_call_flow() {
        let mut call = make_incoming_call();

        assert!(call.state.is_ringing());
        assert!(call.state.can_accept());

        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        assert!(matches!(call.state, CallState::Answering { .. }));

        call.apply_transition(CallTransition::LocalDescriptionSent)
            .unwrap();
        assert!(call.state.is_connecting());

        call.apply_transition(CallTransition::TransportConnected {
            kind: CallKind::Video,
        })
        .unwrap();
        assert!(call.state.is_active());

        // Video should be on for video calls.
        if let CallState::Active { video_off, .. } = call.state {
            assert!(!video_off);
        }

        call.apply_transition(CallTransition::RemoteEnded).unwrap();
        assert!(call.state.is_ended());
        assert_eq!(call.outcome(), Some(CallOutcome::Completed));
    }

    /// A remote answer while still OFFERING implies acceptance; the relay
    /// may reorder answer before call-accepted.
    #[test]
    fn test_answer_before_accept_advances_to_connecting() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::RemoteAnswered).unwrap();
        assert!(call.state.is_connecting());
    }

    #[test]
    fn test_outgoing_call_rejected() {
        let mut call = make_outgoing_call();

        call.apply_transition(CallTransition::RemoteRejected {
            reason: EndReason::Declined,
        })
        .unwrap();

        assert!(call.state.is_ended());
        assert_eq!(call.end_reason(), Some(EndReason::Declined));
        assert_eq!(call.outcome(), Some(CallOutcome::Failed));
    }

    #[test]
    fn test_ring_timeout_ends_unanswered() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::RingTimeout).unwrap();
        assert!(call.state.is_ended());
        assert!(!call.answered);
        assert_eq!(call.end_reason(), Some(EndReason::RingTimeout));
    }

    #[test]
    fn test_offer_timeout_fails_call() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::OfferTimeout).unwrap();
        assert_eq!(call.outcome(), Some(CallOutcome::Failed));
    }

    #[test]
    fn test_connect_timeout_fails_call() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::RemoteAccepted).unwrap();
        call.apply_transition(CallTransition::ConnectTimeout).unwrap();
        assert_eq!(call.end_reason(), Some(EndReason::ConnectTimeout));
    }

    /// Mute toggles stay within Active and preserve the other media flag.
    #[test]
    fn test_mute_preserves_video_state() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        call.apply_transition(CallTransition::LocalDescriptionSent)
            .unwrap();
        call.apply_transition(CallTransition::TransportConnected {
            kind: CallKind::Video,
        })
        .unwrap();

        call.apply_transition(CallTransition::AudioMuteChanged { muted: true })
            .unwrap();
        call.apply_transition(CallTransition::VideoStateChanged { off: true })
            .unwrap();

        if let CallState::Active {
            audio_muted,
            video_off,
            ..
        } = call.state
        {
            assert!(audio_muted);
            assert!(video_off);
        } else {
            panic!("expected Active");
        }
    }

    /// Test invalid state transitions are rejected and leave state intact.
    #[test]
    fn test_invalid_transitions() {
        let mut call = make_outgoing_call();

        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
        assert!(
            call.apply_transition(CallTransition::TransportConnected {
                kind: CallKind::Voice,
            })
            .is_err()
        );
        assert!(matches!(call.state, CallState::Offering { .. }));
    }

    /// Ended calls reject all further transitions; ended_at is set once.
    #[test]
    fn test_ended_call_rejects_transitions() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::LocalRejected {
            reason: EndReason::Declined,
        })
        .unwrap();
        let first_ended_at = call.ended_at;

        assert!(call.apply_transition(CallTransition::RemoteEnded).is_err());
        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
        assert_eq!(call.ended_at, first_ended_at);
    }

    #[test]
    fn test_candidate_queue_drains_in_arrival_order() {
        let mut call = make_outgoing_call();
        call.queue_candidate(IceCandidate::new("candidate:1"));
        call.queue_candidate(IceCandidate::new("candidate:2"));
        call.queue_candidate(IceCandidate::new("candidate:3"));

        let drained = call.drain_candidates();
        let order: Vec<_> = drained.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(order, ["candidate:1", "candidate:2", "candidate:3"]);
        assert!(call.drain_candidates().is_empty());
    }

    #[test]
    fn test_peer_and_local_by_role() {
        let outgoing = make_outgoing_call();
        assert_eq!(outgoing.peer().as_str(), "child-1");
        assert_eq!(outgoing.local().as_str(), "guardian-1");

        let incoming = make_incoming_call();
        assert_eq!(incoming.peer().as_str(), "guardian-1");
        assert_eq!(incoming.local().as_str(), "child-1");
    }
}
