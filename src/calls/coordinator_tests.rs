//! Integration tests for the call coordinator.
//!
//! These drive a real coordinator over the in-memory relay with a mock peer
//! transport, exercising the orchestration scenarios end to end: the happy
//! path to ACTIVE, ring timeout, busy auto-reject, candidate reordering, and
//! end-call idempotence.

mod tests {
    use crate::calls::manager::{CallManager, CallManagerConfig};
    use crate::calls::signaling::{
        IceCandidate, SessionDescription, SignalingAction, SignalingMessage,
    };
    use crate::calls::state::CallState;
    use crate::calls::ledger::{CallLedger, LedgerConfig};
    use crate::relay::{ChatMessage, Delivery, Envelope, InMemoryRelay, SignalingChannel};
    use crate::store::MemoryStore;
    use crate::transport::{
        PeerSession, PeerTransport, TransportError, TransportEvent,
    };
    use crate::traversal::{TraversalConfig, TraversalResolver};
    use crate::types::events::EventBus;
    use async_trait::async_trait;
    use chrono::Utc;
    use kincore::channel::{ChannelName, family_channel};
    use kincore::types::{CallId, CallKind, ConnectionType, DeviceId, EndReason, TransportStats};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::timeout;

    const GUARDIAN: &str = "guardian-1";
    const CHILD: &str = "child-1";
    const FAMILY: &str = "fam1";

    // -- Mock peer transport --

    struct MockSession {
        events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
        remote_descriptions: Mutex<Vec<SessionDescription>>,
        candidates: Mutex<Vec<IceCandidate>>,
    }

    impl MockSession {
        fn applied_candidates(&self) -> Vec<String> {
            self.candidates
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.candidate.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PeerSession for MockSession {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::offer("v=0 mock-offer"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::answer("v=0 mock-answer"))
        }
        async fn set_remote_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), TransportError> {
            self.remote_descriptions.lock().unwrap().push(description);
            Ok(())
        }
        async fn add_remote_candidate(
            &self,
            candidate: IceCandidate,
        ) -> Result<(), TransportError> {
            self.candidates.lock().unwrap().push(candidate);
            Ok(())
        }
        async fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
            self.events_rx.lock().await.take()
        }
        async fn stats(&self) -> Result<TransportStats, TransportError> {
            Ok(TransportStats::default())
        }
        fn connection_type(&self) -> ConnectionType {
            ConnectionType::Wifi
        }
        async fn set_video_enabled(&self, _enabled: bool) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    #[derive(Default)]
    struct MockTransport {
        sessions: Mutex<Vec<(Arc<MockSession>, mpsc::Sender<TransportEvent>)>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Wait for the coordinator's setup task to open a session.
        async fn wait_for_session(&self) -> (Arc<MockSession>, mpsc::Sender<TransportEvent>) {
            for _ in 0..100 {
                if let Some((session, tx)) = self
                    .sessions
                    .lock()
                    .unwrap()
                    .last()
                    .map(|(s, tx)| (s.clone(), tx.clone()))
                {
                    return (session, tx);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("transport session was never opened");
        }
    }

    #[async_trait]
    impl PeerTransport for MockTransport {
        async fn open(
            &self,
            servers: Vec<crate::traversal::TraversalServerConfig>,
            _kind: CallKind,
        ) -> Result<Arc<dyn PeerSession>, TransportError> {
            assert!(!servers.is_empty(), "resolver must always produce servers");
            let (tx, rx) = mpsc::channel(16);
            let session = Arc::new(MockSession {
                events_rx: tokio::sync::Mutex::new(Some(rx)),
                remote_descriptions: Mutex::new(Vec::new()),
                candidates: Mutex::new(Vec::new()),
            });
            self.sessions.lock().unwrap().push((session.clone(), tx));
            Ok(session)
        }
    }

    // -- Harness --

    struct Harness {
        relay: Arc<InMemoryRelay>,
        transport: Arc<MockTransport>,
        manager: Arc<CallManager>,
        channel: ChannelName,
        wire: mpsc::Receiver<Delivery>,
    }

    async fn harness_for(device: &str, config: CallManagerConfig) -> Harness {
        let relay = Arc::new(InMemoryRelay::new());
        let transport = MockTransport::new();
        let resolver = Arc::new(TraversalResolver::with_http(TraversalConfig::default()));
        let ledger = CallLedger::load(LedgerConfig::default(), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let channel = family_channel(FAMILY);
        let wire = relay.subscribe(&channel).await.unwrap();
        let manager = CallManager::spawn(
            DeviceId::from(device),
            FAMILY,
            config,
            relay.clone(),
            transport.clone(),
            resolver,
            ledger,
        )
        .await
        .unwrap();

        Harness {
            relay,
            transport,
            manager,
            channel,
            wire,
        }
    }

    impl Harness {
        /// Next signaling message published by the device under test.
        async fn next_signal_from(&mut self, device: &str) -> SignalingMessage {
            let deadline = Duration::from_secs(2);
            loop {
                let delivery = timeout(deadline, self.wire.recv())
                    .await
                    .expect("timed out waiting for wire message")
                    .expect("wire closed");
                if let Envelope::Signaling(msg) = delivery.envelope
                    && msg.from.as_str() == device
                {
                    return msg;
                }
            }
        }

        async fn inject(&self, msg: SignalingMessage) {
            self.relay
                .publish(&self.channel, Envelope::Signaling(msg))
                .await
                .unwrap();
        }

        async fn wait_for_state(
            rx: &mut broadcast::Receiver<Arc<crate::types::events::CallStateChanged>>,
            pred: impl Fn(&CallState) -> bool,
        ) -> CallState {
            let deadline = Duration::from_secs(2);
            loop {
                let event = timeout(deadline, rx.recv())
                    .await
                    .expect("timed out waiting for state change")
                    .expect("event bus closed");
                if pred(&event.state) {
                    return event.state.clone();
                }
            }
        }
    }

    fn events(manager: &Arc<CallManager>) -> &Arc<EventBus> {
        manager.events()
    }

    /// Scenario: caller starts a voice call, the callee accepts and answers,
    /// the transport connects, and the call reaches ACTIVE.
    #[tokio::test]
    async fn test_outgoing_voice_call_reaches_active() {
        let mut h = harness_for(GUARDIAN, CallManagerConfig::default()).await;
        let mut state_rx = events(&h.manager).call_state.subscribe();

        let call_id = h
            .manager
            .start_call(DeviceId::from(CHILD), CallKind::Voice)
            .await
            .unwrap();

        // call-request hits the wire.
        let request = h.next_signal_from(GUARDIAN).await;
        assert_eq!(request.action, SignalingAction::CallRequest);
        assert_eq!(request.call_id, call_id);
        assert_eq!(request.call_kind, Some(CallKind::Voice));
        assert_eq!(request.to.as_str(), CHILD);

        // Callee accepts.
        h.inject(SignalingMessage::call_accepted(
            call_id.clone(),
            DeviceId::from(CHILD),
            DeviceId::from(GUARDIAN),
            h.channel.clone(),
        ))
        .await;
        Harness::wait_for_state(&mut state_rx, CallState::is_connecting).await;

        // The caller publishes its prepared offer.
        let offer = h.next_signal_from(GUARDIAN).await;
        assert_eq!(offer.action, SignalingAction::Offer);

        // Callee answers; transport reports connected.
        h.inject(SignalingMessage::answer(
            call_id.clone(),
            DeviceId::from(CHILD),
            DeviceId::from(GUARDIAN),
            h.channel.clone(),
            SessionDescription::answer("v=0 callee-answer"),
        ))
        .await;

        let (session, transport_tx) = h.transport.wait_for_session().await;
        // The transport cannot connect before the remote description is in.
        for _ in 0..100 {
            if !session.remote_descriptions.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        transport_tx.send(TransportEvent::Connected).await.unwrap();

        Harness::wait_for_state(&mut state_rx, CallState::is_active).await;
        assert_eq!(
            session.remote_descriptions.lock().unwrap().len(),
            1,
            "answer applied exactly once"
        );
    }

    /// Scenario: a ringing callee that never acts times out, transitions to
    /// ENDED(failed), and publishes exactly one call-rejected.
    #[tokio::test]
    async fn test_ring_timeout_publishes_one_rejection() {
        let config = CallManagerConfig {
            ring_timeout: Duration::from_millis(100),
            ..CallManagerConfig::default()
        };
        let mut h = harness_for(CHILD, config).await;
        let mut ended_rx = events(&h.manager).call_ended.subscribe();

        let call_id = CallId::generate();
        h.inject(SignalingMessage::call_request(
            call_id.clone(),
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            CallKind::Voice,
        ))
        .await;

        let ended = timeout(Duration::from_secs(2), ended_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ended.reason, EndReason::RingTimeout);

        // Exactly one call-rejected on the wire.
        let rejection = h.next_signal_from(CHILD).await;
        assert_eq!(rejection.action, SignalingAction::CallRejected);
        assert_eq!(rejection.call_id, call_id);
        let extra = timeout(Duration::from_millis(200), async {
            h.next_signal_from(CHILD).await
        })
        .await;
        assert!(extra.is_err(), "no second terminal message");
    }

    /// A call-request while another call is live is auto-rejected without
    /// touching the current session.
    #[tokio::test]
    async fn test_busy_call_request_is_auto_rejected() {
        let mut h = harness_for(CHILD, CallManagerConfig::default()).await;
        let mut incoming_rx = events(&h.manager).incoming_call.subscribe();
        let mut ended_rx = events(&h.manager).call_ended.subscribe();

        let first = CallId::generate();
        h.inject(SignalingMessage::call_request(
            first.clone(),
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            CallKind::Voice,
        ))
        .await;
        timeout(Duration::from_secs(1), incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let second = CallId::generate();
        h.inject(SignalingMessage::call_request(
            second.clone(),
            DeviceId::from("guardian-2"),
            DeviceId::from(CHILD),
            h.channel.clone(),
            CallKind::Video,
        ))
        .await;

        let rejection = h.next_signal_from(CHILD).await;
        assert_eq!(rejection.action, SignalingAction::CallRejected);
        assert_eq!(rejection.call_id, second);
        assert_eq!(rejection.to.as_str(), "guardian-2");

        // The first call is still ringing: no call_ended event.
        assert!(ended_rx.try_recv().is_err());

        // A replay of the live call's request is absorbed silently.
        h.inject(SignalingMessage::call_request(
            first,
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            CallKind::Voice,
        ))
        .await;
        let extra = timeout(Duration::from_millis(200), async {
            h.next_signal_from(CHILD).await
        })
        .await;
        assert!(extra.is_err(), "replayed request must not be rejected");
    }

    /// Candidates delivered before the offer are queued and applied exactly
    /// once, in arrival order, after the description is set.
    #[tokio::test]
    async fn test_candidates_before_description_flush_in_order() {
        let mut h = harness_for(CHILD, CallManagerConfig::default()).await;
        let mut incoming_rx = events(&h.manager).incoming_call.subscribe();

        let call_id = CallId::generate();
        h.inject(SignalingMessage::call_request(
            call_id.clone(),
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            CallKind::Voice,
        ))
        .await;
        timeout(Duration::from_secs(1), incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // Candidates overtake the offer.
        for i in 1..=3 {
            h.inject(SignalingMessage::ice_candidate(
                call_id.clone(),
                DeviceId::from(GUARDIAN),
                DeviceId::from(CHILD),
                h.channel.clone(),
                IceCandidate::new(format!("candidate:{i}")),
            ))
            .await;
        }

        h.manager.accept_call().await.unwrap();
        let accepted = h.next_signal_from(CHILD).await;
        assert_eq!(accepted.action, SignalingAction::CallAccepted);

        h.inject(SignalingMessage::offer(
            call_id.clone(),
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            SessionDescription::offer("v=0 caller-offer"),
        ))
        .await;

        // The callee answers once the description lands.
        let answer = h.next_signal_from(CHILD).await;
        assert_eq!(answer.action, SignalingAction::Answer);

        let (session, _tx) = h.transport.wait_for_session().await;
        assert_eq!(session.remote_descriptions.lock().unwrap().len(), 1);
        assert_eq!(
            session.applied_candidates(),
            vec!["candidate:1", "candidate:2", "candidate:3"],
            "queued candidates flush in arrival order after the description"
        );

        // A candidate arriving after the description applies directly.
        h.inject(SignalingMessage::ice_candidate(
            call_id,
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            IceCandidate::new("candidate:4"),
        ))
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.applied_candidates().len(), 4);
    }

    /// Receiving end-call twice is a no-op the second time.
    #[tokio::test]
    async fn test_duplicate_end_call_is_idempotent() {
        let mut h = harness_for(CHILD, CallManagerConfig::default()).await;
        let mut incoming_rx = events(&h.manager).incoming_call.subscribe();
        let mut ended_rx = events(&h.manager).call_ended.subscribe();

        let call_id = CallId::generate();
        h.inject(SignalingMessage::call_request(
            call_id.clone(),
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            CallKind::Voice,
        ))
        .await;
        timeout(Duration::from_secs(1), incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let end = SignalingMessage::end_call(
            call_id,
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            EndReason::UserHangUp,
        );
        h.inject(end.clone()).await;

        let ended = timeout(Duration::from_secs(1), ended_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ended.reason, EndReason::RemoteEnded);

        // Replay: absorbed, no second call_ended.
        h.inject(end).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(ended_rx.try_recv().is_err());
    }

    /// Declining a ringing call publishes call-rejected and archives a
    /// failed call.
    #[tokio::test]
    async fn test_reject_call_publishes_rejection() {
        let mut h = harness_for(CHILD, CallManagerConfig::default()).await;
        let mut incoming_rx = events(&h.manager).incoming_call.subscribe();

        let call_id = CallId::generate();
        h.inject(SignalingMessage::call_request(
            call_id.clone(),
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            CallKind::Video,
        ))
        .await;
        timeout(Duration::from_secs(1), incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();

        h.manager.reject_call().await.unwrap();
        let rejection = h.next_signal_from(CHILD).await;
        assert_eq!(rejection.action, SignalingAction::CallRejected);
        assert_eq!(rejection.call_id, call_id);
        assert_eq!(rejection.reason, Some(EndReason::Declined));

        // Accepting after the decline is an invalid transition.
        assert!(h.manager.accept_call().await.is_err());
    }

    /// The caller hanging up an outgoing call publishes end-call and the
    /// callee side archives it; a missed incoming call bumps the badge.
    #[tokio::test]
    async fn test_caller_cancel_counts_missed_for_callee() {
        let mut h = harness_for(CHILD, CallManagerConfig::default()).await;
        let mut incoming_rx = events(&h.manager).incoming_call.subscribe();
        let mut badge_rx = events(&h.manager).badges.subscribe();

        let call_id = CallId::generate();
        h.inject(SignalingMessage::call_request(
            call_id.clone(),
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            CallKind::Voice,
        ))
        .await;
        timeout(Duration::from_secs(1), incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // Caller gives up before the callee answers.
        h.inject(SignalingMessage::end_call(
            call_id,
            DeviceId::from(GUARDIAN),
            DeviceId::from(CHILD),
            h.channel.clone(),
            EndReason::UserHangUp,
        ))
        .await;

        let badge = timeout(Duration::from_secs(1), badge_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(badge.conversation, GUARDIAN);
        assert_eq!(badge.counters.missed_calls, 1);
        assert_eq!(h.manager.ledger().badges(GUARDIAN).missed_calls, 1);
    }

    /// start_call while a session is live fails with Busy.
    #[tokio::test]
    async fn test_start_call_while_busy_fails() {
        let mut h = harness_for(GUARDIAN, CallManagerConfig::default()).await;

        h.manager
            .start_call(DeviceId::from(CHILD), CallKind::Voice)
            .await
            .unwrap();
        let _ = h.next_signal_from(GUARDIAN).await;

        let err = h
            .manager
            .start_call(DeviceId::from("child-2"), CallKind::Voice)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::calls::CallError::Busy));
    }

    /// A failed publish surfaces to the caller instead of creating a
    /// half-open session.
    #[tokio::test]
    async fn test_relay_failure_surfaces_on_start() {
        let h = harness_for(GUARDIAN, CallManagerConfig::default()).await;
        h.relay.set_fail_publishes(true);

        let err = h
            .manager
            .start_call(DeviceId::from(CHILD), CallKind::Voice)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::calls::CallError::Relay(_)));

        // The failed attempt left the device idle.
        h.relay.set_fail_publishes(false);
        h.manager
            .start_call(DeviceId::from(CHILD), CallKind::Voice)
            .await
            .unwrap();
    }

    /// An inbound chat message bumps the unread badge unless the recipient
    /// is viewing that conversation.
    #[tokio::test]
    async fn test_chat_messages_drive_unread_badges() {
        let h = harness_for(CHILD, CallManagerConfig::default()).await;
        let mut badge_rx = events(&h.manager).badges.subscribe();
        let mut chat_rx = events(&h.manager).chat_message.subscribe();

        let chat = ChatMessage {
            from: DeviceId::from(GUARDIAN),
            to: DeviceId::from(CHILD),
            channel: h.channel.clone(),
            conversation: GUARDIAN.to_string(),
            body: "time for dinner".to_string(),
            timestamp: Utc::now(),
        };
        h.relay
            .publish(&h.channel, Envelope::Chat(chat.clone()))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), chat_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message.body, "time for dinner");

        let badge = timeout(Duration::from_secs(1), badge_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(badge.counters.unread_messages, 1);

        // Viewing the conversation suppresses further increments.
        h.manager
            .set_active_conversation(Some(GUARDIAN.to_string()))
            .await
            .unwrap();
        h.relay
            .publish(&h.channel, Envelope::Chat(chat))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.manager.ledger().badges(GUARDIAN).unread_messages, 1);
    }
}
