//! Call coordinator.
//!
//! One coordinator task owns the single live [`CallSession`] per device and
//! serializes everything that can touch it: inbound signaling, user intents,
//! transport events, monitor observations, and timeout fires all arrive as
//! [`Command`]s on one queue and are processed strictly one at a time.
//! Stale async completions are detected by comparing the completion's call
//! id against the live session, never by assuming temporal ordering.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};

use super::error::CallError;
use super::ledger::CallLedger;
use super::monitor::{ConnectionHealthMonitor, MediaRenderer, MonitorConfig, MonitorHandle};
use super::quality::{NetworkQualityController, QualityControllerConfig, QualityObservation};
use super::signaling::{SessionDescription, SignalingAction, SignalingMessage};
use super::state::{CallSession, CallState, CallTransition, InvalidTransition};
use crate::relay::{ChatMessage, Delivery, Envelope, SignalingChannel};
use crate::transport::{PeerSession, PeerTransport, TransportError, TransportEvent};
use crate::traversal::TraversalResolver;
use crate::types::events::{
    BadgeChanged, CallEnded, CallStateChanged, ChatReceived, EventBus, IncomingCall,
    QualityChanged,
};
use chrono::Utc;
use kincore::channel::{ChannelName, family_channel};
use kincore::types::{
    BasicCallMeta, CallId, CallKind, CallRole, DeviceId, EndReason, SuppressionAction,
    SuppressionPolicy,
};

/// Configuration for the call coordinator.
#[derive(Clone)]
pub struct CallManagerConfig {
    /// How long an incoming call rings before auto-rejecting.
    pub ring_timeout: Duration,
    /// How long an outgoing request may wait for any response.
    pub offer_timeout: Duration,
    /// How long establishment may take once both sides committed.
    pub connect_timeout: Duration,
    pub monitor: MonitorConfig,
    pub quality: QualityControllerConfig,
    /// Renderer for the health monitor. Without one, health monitoring is
    /// disabled (e.g. headless tests).
    pub renderer: Option<Arc<dyn MediaRenderer>>,
}

impl std::fmt::Debug for CallManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManagerConfig")
            .field("ring_timeout", &self.ring_timeout)
            .field("offer_timeout", &self.offer_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("monitor", &self.monitor)
            .field("quality", &self.quality)
            .field("renderer", &self.renderer.is_some())
            .finish()
    }
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            offer_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(30),
            monitor: MonitorConfig::default(),
            quality: QualityControllerConfig::default(),
            renderer: None,
        }
    }
}

enum Intent {
    StartCall {
        peer: DeviceId,
        kind: CallKind,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    HangUp {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SetMuted { muted: bool },
    SetVideoOff { off: bool },
    ReenableVideo,
    RetryPlayback,
    SetActiveConversation { conversation: Option<String> },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutStage {
    Ring,
    Offer,
    Connect,
}

struct SetupOutput {
    peer: Arc<dyn PeerSession>,
    local_offer: Option<SessionDescription>,
}

enum Command {
    Intent(Intent),
    Inbound(Delivery),
    Transport {
        call_id: CallId,
        event: TransportEvent,
    },
    SetupReady {
        call_id: CallId,
        result: Result<SetupOutput, TransportError>,
    },
    Timeout {
        call_id: CallId,
        stage: TimeoutStage,
    },
    Quality(QualityObservation),
}

/// Public handle to the coordinator. Methods enqueue intents; the
/// coordinator task applies them in arrival order.
pub struct CallManager {
    device_id: DeviceId,
    channel: ChannelName,
    cmd_tx: mpsc::Sender<Command>,
    events: Arc<EventBus>,
    ledger: Arc<CallLedger>,
}

impl CallManager {
    /// Subscribe to the family channel and start the coordinator task.
    pub async fn spawn(
        device_id: DeviceId,
        family_id: &str,
        config: CallManagerConfig,
        relay: Arc<dyn SignalingChannel>,
        transport: Arc<dyn PeerTransport>,
        resolver: Arc<TraversalResolver>,
        ledger: Arc<CallLedger>,
    ) -> Result<Arc<Self>, CallError> {
        let channel = family_channel(family_id);
        let events = Arc::new(EventBus::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let mut relay_rx = relay.subscribe(&channel).await?;
        let pump_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(delivery) = relay_rx.recv().await {
                if pump_tx.send(Command::Inbound(delivery)).await.is_err() {
                    return;
                }
            }
        });

        let coordinator = Coordinator {
            device_id: device_id.clone(),
            channel: channel.clone(),
            config,
            relay,
            transport,
            resolver,
            events: events.clone(),
            ledger: ledger.clone(),
            cmd_tx: cmd_tx.clone(),
            session: None,
            peer: None,
            pending_remote_description: None,
            local_offer: None,
            offer_published: false,
            suppression: SuppressionPolicy::new(),
            monitor: None,
            quality_stop: None,
        };
        tokio::spawn(coordinator.run(cmd_rx));

        Ok(Arc::new(Self {
            device_id,
            channel,
            cmd_tx,
            events,
            ledger,
        }))
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// The observable surface for the surrounding app.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn ledger(&self) -> &Arc<CallLedger> {
        &self.ledger
    }

    /// Start an outgoing call. Fails with [`CallError::Busy`] while any
    /// non-terminal session exists.
    pub async fn start_call(&self, peer: DeviceId, kind: CallKind) -> Result<CallId, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send_intent(Intent::StartCall { peer, kind, reply }).await?;
        rx.await.map_err(|_| CallError::NotRunning)?
    }

    /// Accept the ringing incoming call.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send_intent(Intent::Accept { reply }).await?;
        rx.await.map_err(|_| CallError::NotRunning)?
    }

    /// Decline the ringing incoming call.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send_intent(Intent::Reject { reply }).await?;
        rx.await.map_err(|_| CallError::NotRunning)?
    }

    /// End the live call.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send_intent(Intent::HangUp { reply }).await?;
        rx.await.map_err(|_| CallError::NotRunning)?
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.send_intent(Intent::SetMuted { muted }).await
    }

    pub async fn set_video_off(&self, off: bool) -> Result<(), CallError> {
        self.send_intent(Intent::SetVideoOff { off }).await
    }

    /// Explicitly re-enable video after quality suppression.
    pub async fn reenable_video(&self) -> Result<(), CallError> {
        self.send_intent(Intent::ReenableVideo).await
    }

    /// User gesture retrying playback after a tap-to-retry or error flag.
    pub async fn retry_playback(&self) -> Result<(), CallError> {
        self.send_intent(Intent::RetryPlayback).await
    }

    /// Mark which conversation the user is viewing; its messages do not
    /// increment the unread badge.
    pub async fn set_active_conversation(
        &self,
        conversation: Option<String>,
    ) -> Result<(), CallError> {
        self.send_intent(Intent::SetActiveConversation { conversation })
            .await
    }

    pub async fn shutdown(&self) {
        let _ = self
            .cmd_tx
            .send(Command::Intent(Intent::Shutdown))
            .await;
    }

    async fn send_intent(&self, intent: Intent) -> Result<(), CallError> {
        self.cmd_tx
            .send(Command::Intent(intent))
            .await
            .map_err(|_| CallError::NotRunning)
    }
}

struct Coordinator {
    device_id: DeviceId,
    channel: ChannelName,
    config: CallManagerConfig,
    relay: Arc<dyn SignalingChannel>,
    transport: Arc<dyn PeerTransport>,
    resolver: Arc<TraversalResolver>,
    events: Arc<EventBus>,
    ledger: Arc<CallLedger>,
    cmd_tx: mpsc::Sender<Command>,

    session: Option<CallSession>,
    peer: Option<Arc<dyn PeerSession>>,
    /// Remote description that arrived before the transport was ready.
    pending_remote_description: Option<SessionDescription>,
    /// Our prepared offer (initiator), published once the callee accepts.
    local_offer: Option<SessionDescription>,
    offer_published: bool,
    suppression: SuppressionPolicy,
    monitor: Option<MonitorHandle>,
    quality_stop: Option<Arc<Notify>>,
}

impl Coordinator {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        debug!(target: "Calls/Manager", "Coordinator started for {}", self.device_id);
        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::Intent(Intent::Shutdown) => break,
                Command::Intent(intent) => self.handle_intent(intent).await,
                Command::Inbound(delivery) => self.handle_inbound(delivery).await,
                Command::Transport { call_id, event } => {
                    self.handle_transport_event(call_id, event).await
                }
                Command::SetupReady { call_id, result } => {
                    self.handle_setup_ready(call_id, result).await
                }
                Command::Timeout { call_id, stage } => self.handle_timeout(call_id, stage).await,
                Command::Quality(observation) => self.handle_quality(observation).await,
            }
        }

        if self.session.as_ref().is_some_and(|s| s.is_live()) {
            let transition = if self.session.as_ref().is_some_and(|s| s.state.is_ringing()) {
                CallTransition::LocalRejected {
                    reason: EndReason::Declined,
                }
            } else {
                CallTransition::LocalHangUp
            };
            self.end_session(transition, true).await;
        }
        self.release_call_resources();
        debug!(target: "Calls/Manager", "Coordinator stopped for {}", self.device_id);
    }

    // ==================== user intents ====================

    async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::StartCall { peer, kind, reply } => {
                let _ = reply.send(self.handle_start_call(peer, kind).await);
            }
            Intent::Accept { reply } => {
                let _ = reply.send(self.handle_accept().await);
            }
            Intent::Reject { reply } => {
                let _ = reply.send(self.handle_reject().await);
            }
            Intent::HangUp { reply } => {
                let _ = reply.send(self.handle_hang_up().await);
            }
            Intent::SetMuted { muted } => self.handle_set_muted(muted).await,
            Intent::SetVideoOff { off } => self.handle_set_video_off(off).await,
            Intent::ReenableVideo => self.handle_reenable_video().await,
            Intent::RetryPlayback => {
                if let Some(monitor) = &self.monitor {
                    let _ = monitor.retry.send(()).await;
                }
            }
            Intent::SetActiveConversation { conversation } => {
                self.ledger.set_active_conversation(conversation).await;
            }
            Intent::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_start_call(
        &mut self,
        peer: DeviceId,
        kind: CallKind,
    ) -> Result<CallId, CallError> {
        if self.session.as_ref().is_some_and(|s| s.is_live()) {
            return Err(CallError::Busy);
        }

        let call_id = CallId::generate();
        let request = SignalingMessage::call_request(
            call_id.clone(),
            self.device_id.clone(),
            peer.clone(),
            self.channel.clone(),
            kind,
        );
        self.relay
            .publish(&self.channel, Envelope::Signaling(request))
            .await?;

        info!(target: "Calls/Manager", "Starting {kind:?} call {call_id} to {peer}");
        let session = CallSession::new_outgoing(
            call_id.clone(),
            self.device_id.clone(),
            peer,
            self.channel.clone(),
            kind,
        );
        self.reset_call_scratch();
        self.session = Some(session);
        self.emit_state();
        self.arm_timeout(call_id.clone(), TimeoutStage::Offer, self.config.offer_timeout);
        self.spawn_setup(call_id.clone(), kind, true);
        Ok(call_id)
    }

    async fn handle_accept(&mut self) -> Result<(), CallError> {
        let (call_id, caller, kind) = {
            let session = self.session.as_ref().ok_or(CallError::NoLiveCall)?;
            if !session.state.can_accept() {
                return Err(CallError::InvalidTransition(InvalidTransition {
                    current_state: format!("{:?}", session.state),
                    attempted: "LocalAccepted".to_string(),
                }));
            }
            (
                session.id.clone(),
                session.participants.caller.clone(),
                session.kind,
            )
        };

        // The transition guard is the single authority for consuming the
        // incoming call; it fires before anything observable happens.
        if let Some(session) = self.session.as_mut() {
            session.apply_transition(CallTransition::LocalAccepted)?;
        }

        let accepted = SignalingMessage::call_accepted(
            call_id.clone(),
            self.device_id.clone(),
            caller,
            self.channel.clone(),
        );
        if let Err(e) = self
            .relay
            .publish(&self.channel, Envelope::Signaling(accepted))
            .await
        {
            warn!(target: "Calls/Manager", "Failed to publish call-accepted: {e}");
            self.end_session(
                CallTransition::TransportFailed {
                    reason: EndReason::RelayUnavailable,
                },
                false,
            )
            .await;
            return Err(e.into());
        }

        self.emit_state();
        self.arm_timeout(call_id.clone(), TimeoutStage::Connect, self.config.connect_timeout);
        self.spawn_setup(call_id, kind, false);
        Ok(())
    }

    async fn handle_reject(&mut self) -> Result<(), CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoLiveCall)?;
        if !session.state.can_reject() {
            return Err(CallError::InvalidTransition(InvalidTransition {
                current_state: format!("{:?}", session.state),
                attempted: "LocalRejected".to_string(),
            }));
        }
        self.end_session(
            CallTransition::LocalRejected {
                reason: EndReason::Declined,
            },
            true,
        )
        .await;
        Ok(())
    }

    async fn handle_hang_up(&mut self) -> Result<(), CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoLiveCall)?;
        if !session.is_live() {
            return Err(CallError::NoLiveCall);
        }
        let transition = if session.state.is_ringing() {
            CallTransition::LocalRejected {
                reason: EndReason::Declined,
            }
        } else {
            CallTransition::LocalHangUp
        };
        self.end_session(transition, true).await;
        Ok(())
    }

    async fn handle_set_muted(&mut self, muted: bool) {
        let Some(session) = self.session.as_mut() else { return };
        if session
            .apply_transition(CallTransition::AudioMuteChanged { muted })
            .is_ok()
        {
            self.emit_state();
        }
    }

    async fn handle_set_video_off(&mut self, off: bool) {
        let Some(session) = self.session.as_mut() else { return };
        if session
            .apply_transition(CallTransition::VideoStateChanged { off })
            .is_err()
        {
            return;
        }
        if let Some(peer) = self.peer.clone()
            && let Err(e) = peer.set_video_enabled(!off).await
        {
            warn!(target: "Calls/Manager", "Failed to toggle video: {e}");
        }
        self.emit_state();
    }

    async fn handle_reenable_video(&mut self) {
        let Some(session) = self.session.as_mut() else { return };
        if !session.state.is_active() || !session.quality.video_suppressed {
            return;
        }
        session.quality.video_suppressed = false;
        let _ = session.apply_transition(CallTransition::VideoStateChanged { off: false });
        let quality = session.quality;
        let call_id = session.id.clone();
        self.suppression.reset();

        if let Some(peer) = self.peer.clone()
            && let Err(e) = peer.set_video_enabled(true).await
        {
            warn!(target: "Calls/Manager", "Failed to re-enable video: {e}");
        }
        info!(target: "Calls/Manager", "Video re-enabled for call {call_id}");
        let _ = self.events.quality.send(Arc::new(QualityChanged {
            call_id,
            state: quality,
            reenable_available: false,
        }));
        self.emit_state();
    }

    // ==================== inbound envelopes ====================

    async fn handle_inbound(&mut self, delivery: Delivery) {
        match delivery.envelope {
            Envelope::Signaling(msg) => self.handle_signal(msg).await,
            Envelope::Chat(msg) => self.handle_chat(msg).await,
            Envelope::Unknown => {
                debug!(target: "Calls/Manager", "Skipping unknown envelope kind");
            }
        }
    }

    async fn handle_signal(&mut self, msg: SignalingMessage) {
        // The relay echoes our own publishes back to us.
        if msg.from == self.device_id || msg.to != self.device_id {
            return;
        }
        if let Err(e) = msg.validate() {
            warn!(
                target: "Calls/Manager",
                "Skipping malformed {} message: {e}", msg.action
            );
            return;
        }
        debug!(
            target: "Calls/Manager",
            "Received {} from {} (call {})", msg.action, msg.from, msg.call_id
        );

        match msg.action {
            SignalingAction::CallRequest => self.on_call_request(msg).await,
            SignalingAction::CallAccepted => self.on_call_accepted(msg).await,
            SignalingAction::CallRejected => self.on_call_rejected(msg).await,
            SignalingAction::Offer => self.on_offer(msg).await,
            SignalingAction::Answer => self.on_answer(msg).await,
            SignalingAction::IceCandidate => self.on_candidate(msg).await,
            SignalingAction::EndCall => self.on_end_call(msg).await,
        }
    }

    async fn handle_chat(&mut self, msg: ChatMessage) {
        if msg.from == self.device_id || msg.to != self.device_id {
            return;
        }
        let _ = self.events.chat_message.send(Arc::new(ChatReceived {
            message: msg.clone(),
        }));
        if let Some((conversation, counters)) =
            self.ledger.note_incoming_message(&msg.conversation).await
        {
            let _ = self.events.badges.send(Arc::new(BadgeChanged {
                conversation,
                counters,
            }));
        }
    }

    async fn on_call_request(&mut self, msg: SignalingMessage) {
        if let Some(session) = &self.session
            && session.is_live()
        {
            if session.id == msg.call_id {
                // At-least-once delivery: a replay of the call we are
                // already handling is absorbed.
                debug!(target: "Calls/Manager", "Duplicate call-request for {}", msg.call_id);
            } else {
                info!(
                    target: "Calls/Manager",
                    "Busy, auto-rejecting call-request {} from {}", msg.call_id, msg.from
                );
                let reject = SignalingMessage::call_rejected(
                    msg.call_id,
                    self.device_id.clone(),
                    msg.from,
                    self.channel.clone(),
                    EndReason::Declined,
                );
                if let Err(e) = self
                    .relay
                    .publish(&self.channel, Envelope::Signaling(reject))
                    .await
                {
                    warn!(target: "Calls/Manager", "Failed to publish busy rejection: {e}");
                }
            }
            return;
        }

        let Some(kind) = msg.call_kind else { return };
        info!(
            target: "Calls/Manager",
            "Incoming {kind:?} call {} from {}", msg.call_id, msg.from
        );
        let session = CallSession::new_incoming(
            msg.call_id.clone(),
            msg.from.clone(),
            self.device_id.clone(),
            self.channel.clone(),
            kind,
        );
        self.reset_call_scratch();
        self.session = Some(session);
        self.arm_timeout(msg.call_id.clone(), TimeoutStage::Ring, self.config.ring_timeout);

        let _ = self.events.incoming_call.send(Arc::new(IncomingCall {
            meta: BasicCallMeta {
                call_id: msg.call_id,
                peer: msg.from,
                kind,
                timestamp: msg.timestamp,
            },
        }));
        self.emit_state();
    }

    async fn on_call_accepted(&mut self, msg: SignalingMessage) {
        let advanced = {
            let Some(session) = self.session.as_mut() else { return };
            if session.id != msg.call_id || !session.is_live() || !session.is_initiator() {
                debug!(target: "Calls/Manager", "Ignoring stale call-accepted for {}", msg.call_id);
                return;
            }
            match session.apply_transition(CallTransition::RemoteAccepted) {
                Ok(()) => true,
                // Already Connecting (the answer overtook call-accepted).
                Err(_) => false,
            }
        };

        if advanced {
            self.emit_state();
            let call_id = msg.call_id.clone();
            self.arm_timeout(call_id, TimeoutStage::Connect, self.config.connect_timeout);
            self.ensure_monitor();
        }
        self.publish_offer().await;
    }

    async fn on_call_rejected(&mut self, msg: SignalingMessage) {
        let matches = self
            .session
            .as_ref()
            .is_some_and(|s| s.id == msg.call_id && s.is_live());
        if !matches {
            debug!(target: "Calls/Manager", "Ignoring call-rejected for {}", msg.call_id);
            return;
        }
        let reason = msg.reason.unwrap_or(EndReason::Declined);
        self.end_session(CallTransition::RemoteRejected { reason }, false)
            .await;
    }

    async fn on_offer(&mut self, msg: SignalingMessage) {
        {
            let Some(session) = self.session.as_ref() else { return };
            if session.id != msg.call_id
                || !session.is_live()
                || session.role != CallRole::Responder
            {
                debug!(target: "Calls/Manager", "Ignoring offer for {}", msg.call_id);
                return;
            }
            if session.remote_description_applied {
                debug!(target: "Calls/Manager", "Duplicate offer for {}", msg.call_id);
                return;
            }
        }
        let Some(description) = msg.description else { return };
        self.pending_remote_description = Some(description);
        self.complete_answer().await;
    }

    async fn on_answer(&mut self, msg: SignalingMessage) {
        let advanced = {
            let Some(session) = self.session.as_mut() else { return };
            if session.id != msg.call_id
                || !session.is_live()
                || session.role != CallRole::Initiator
            {
                debug!(target: "Calls/Manager", "Ignoring answer for {}", msg.call_id);
                return;
            }
            if session.remote_description_applied {
                debug!(target: "Calls/Manager", "Duplicate answer for {}", msg.call_id);
                return;
            }
            // An answer while still OFFERING implies acceptance; the relay
            // does not order call-accepted ahead of it.
            let was_offering = matches!(session.state, CallState::Offering { .. });
            if session
                .apply_transition(CallTransition::RemoteAnswered)
                .is_err()
            {
                debug!(target: "Calls/Manager", "Answer in state {:?} ignored", session.state);
                return;
            }
            was_offering
        };

        if advanced {
            self.emit_state();
            self.arm_timeout(
                msg.call_id.clone(),
                TimeoutStage::Connect,
                self.config.connect_timeout,
            );
            self.ensure_monitor();
        }
        let Some(description) = msg.description else { return };
        self.pending_remote_description = Some(description);
        self.apply_remote_description().await;
    }

    async fn on_candidate(&mut self, msg: SignalingMessage) {
        let Some(candidate) = msg.candidate else { return };
        let applied = {
            let Some(session) = self.session.as_mut() else {
                debug!(target: "Calls/Manager", "Dropping candidate for {}", msg.call_id);
                return;
            };
            if session.id != msg.call_id || !session.is_live() {
                debug!(target: "Calls/Manager", "Dropping candidate for {}", msg.call_id);
                return;
            }
            if session.remote_description_applied {
                true
            } else {
                // Candidates may overtake the description; queue them in
                // arrival order rather than discarding.
                session.queue_candidate(candidate.clone());
                false
            }
        };

        if applied
            && let Some(peer) = self.peer.clone()
            && let Err(e) = peer.add_remote_candidate(candidate).await
        {
            warn!(target: "Calls/Manager", "Failed to apply candidate: {e}");
        }
    }

    async fn on_end_call(&mut self, msg: SignalingMessage) {
        let matches = self
            .session
            .as_ref()
            .is_some_and(|s| s.id == msg.call_id && s.is_live());
        if !matches {
            // Idempotent: duplicate end-call for an already-ended session.
            debug!(target: "Calls/Manager", "Ignoring end-call for {}", msg.call_id);
            return;
        }
        self.end_session(CallTransition::RemoteEnded, false).await;
    }

    // ==================== transport setup and events ====================

    fn spawn_setup(&self, call_id: CallId, kind: CallKind, initiator: bool) {
        let resolver = self.resolver.clone();
        let transport = self.transport.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let servers = resolver.resolve().await;
                let peer = transport.open(servers, kind).await?;
                let local_offer = if initiator {
                    Some(peer.create_offer().await?)
                } else {
                    None
                };
                Ok(SetupOutput { peer, local_offer })
            }
            .await;
            let _ = cmd_tx.send(Command::SetupReady { call_id, result }).await;
        });
    }

    async fn handle_setup_ready(
        &mut self,
        call_id: CallId,
        result: Result<SetupOutput, TransportError>,
    ) {
        let (live, role) = match &self.session {
            Some(s) if s.id == call_id && s.is_live() => (true, s.role),
            _ => (false, CallRole::Initiator),
        };
        if !live {
            // Stale completion for a call that already ended.
            if let Ok(output) = result {
                let peer = output.peer;
                tokio::spawn(async move { peer.close().await });
            }
            debug!(target: "Calls/Manager", "Discarding stale transport setup for {call_id}");
            return;
        }

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                warn!(target: "Calls/Manager", "Transport setup failed for {call_id}: {e}");
                self.end_session(
                    CallTransition::TransportFailed {
                        reason: EndReason::TransportFailed,
                    },
                    true,
                )
                .await;
                return;
            }
        };

        self.peer = Some(output.peer.clone());
        self.local_offer = output.local_offer;
        self.spawn_event_pump(call_id, output.peer);

        match role {
            CallRole::Initiator => {
                // Publish now if the callee already accepted; otherwise
                // call-accepted will trigger it.
                self.publish_offer().await;
                if self.pending_remote_description.is_some() {
                    self.apply_remote_description().await;
                }
            }
            CallRole::Responder => {
                self.complete_answer().await;
            }
        }
    }

    fn spawn_event_pump(&self, call_id: CallId, peer: Arc<dyn PeerSession>) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let Some(mut events) = peer.take_events().await else { return };
            while let Some(event) = events.recv().await {
                if cmd_tx
                    .send(Command::Transport {
                        call_id: call_id.clone(),
                        event,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });
    }

    async fn handle_transport_event(&mut self, call_id: CallId, event: TransportEvent) {
        let matches = self
            .session
            .as_ref()
            .is_some_and(|s| s.id == call_id && s.is_live());
        if !matches {
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let msg = {
                    let Some(session) = self.session.as_ref() else { return };
                    SignalingMessage::ice_candidate(
                        session.id.clone(),
                        self.device_id.clone(),
                        session.peer().clone(),
                        self.channel.clone(),
                        candidate,
                    )
                };
                // A lost candidate degrades connectivity but other
                // candidates or the relay tier still can succeed.
                if let Err(e) = self
                    .relay
                    .publish(&self.channel, Envelope::Signaling(msg))
                    .await
                {
                    warn!(target: "Calls/Manager", "Failed to publish candidate: {e}");
                }
            }
            TransportEvent::Connected => {
                let kind = {
                    let Some(session) = self.session.as_mut() else { return };
                    if !session.state.is_connecting() {
                        return;
                    }
                    let kind = session.kind;
                    if session
                        .apply_transition(CallTransition::TransportConnected { kind })
                        .is_err()
                    {
                        return;
                    }
                    kind
                };
                info!(target: "Calls/Manager", "Call {call_id} connected ({kind:?})");
                self.emit_state();
                self.start_quality_sampler();
            }
            TransportEvent::Failed(error) => {
                warn!(target: "Calls/Manager", "Transport failed for {call_id}: {error}");
                self.end_session(
                    CallTransition::TransportFailed {
                        reason: EndReason::TransportFailed,
                    },
                    true,
                )
                .await;
            }
            TransportEvent::Disconnected => {
                let active = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.state.is_active());
                if active {
                    // The peer most likely hung up and its end-call was
                    // lost; this is a normal end.
                    self.end_session(CallTransition::RemoteEnded, false).await;
                } else {
                    self.end_session(
                        CallTransition::TransportFailed {
                            reason: EndReason::TransportFailed,
                        },
                        true,
                    )
                    .await;
                }
            }
            TransportEvent::TrackAdded(track) => {
                self.ensure_monitor();
                if let Some(monitor) = &self.monitor {
                    let _ = monitor.tracks.send(track).await;
                }
            }
        }
    }

    // ==================== description/candidate plumbing ====================

    /// Publish our prepared offer once. No-op until both the transport
    /// setup has produced it and the callee has committed.
    async fn publish_offer(&mut self) {
        if self.offer_published {
            return;
        }
        let ready = {
            let Some(session) = self.session.as_ref() else { return };
            session.is_live() && !matches!(session.state, CallState::Offering { .. })
        };
        if !ready {
            return;
        }
        let Some(offer) = self.local_offer.clone() else { return };
        let msg = {
            let Some(session) = self.session.as_ref() else { return };
            SignalingMessage::offer(
                session.id.clone(),
                self.device_id.clone(),
                session.peer().clone(),
                self.channel.clone(),
                offer,
            )
        };
        match self
            .relay
            .publish(&self.channel, Envelope::Signaling(msg))
            .await
        {
            Ok(()) => self.offer_published = true,
            Err(e) => {
                warn!(target: "Calls/Manager", "Failed to publish offer: {e}");
                self.end_session(
                    CallTransition::TransportFailed {
                        reason: EndReason::RelayUnavailable,
                    },
                    false,
                )
                .await;
            }
        }
    }

    /// Initiator: apply the stashed remote answer and flush queued
    /// candidates.
    async fn apply_remote_description(&mut self) {
        let Some(peer) = self.peer.clone() else { return };
        let Some(description) = self.pending_remote_description.take() else {
            return;
        };
        if let Err(e) = peer.set_remote_description(description).await {
            warn!(target: "Calls/Manager", "Failed to apply remote description: {e}");
            self.end_session(
                CallTransition::TransportFailed {
                    reason: EndReason::TransportFailed,
                },
                true,
            )
            .await;
            return;
        }
        self.flush_candidates(peer).await;
    }

    /// Responder: once accepted, transport ready, and the offer present,
    /// apply it, answer, and commit to connecting.
    async fn complete_answer(&mut self) {
        let answering = self
            .session
            .as_ref()
            .is_some_and(|s| matches!(s.state, CallState::Answering { .. }));
        if !answering {
            return;
        }
        let Some(peer) = self.peer.clone() else { return };
        let Some(description) = self.pending_remote_description.take() else {
            return;
        };

        if let Err(e) = peer.set_remote_description(description).await {
            warn!(target: "Calls/Manager", "Failed to apply offer: {e}");
            self.end_session(
                CallTransition::TransportFailed {
                    reason: EndReason::TransportFailed,
                },
                true,
            )
            .await;
            return;
        }
        self.flush_candidates(peer.clone()).await;

        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(target: "Calls/Manager", "Failed to create answer: {e}");
                self.end_session(
                    CallTransition::TransportFailed {
                        reason: EndReason::TransportFailed,
                    },
                    true,
                )
                .await;
                return;
            }
        };

        let msg = {
            let Some(session) = self.session.as_ref() else { return };
            SignalingMessage::answer(
                session.id.clone(),
                self.device_id.clone(),
                session.peer().clone(),
                self.channel.clone(),
                answer,
            )
        };
        if let Err(e) = self
            .relay
            .publish(&self.channel, Envelope::Signaling(msg))
            .await
        {
            warn!(target: "Calls/Manager", "Failed to publish answer: {e}");
            self.end_session(
                CallTransition::TransportFailed {
                    reason: EndReason::RelayUnavailable,
                },
                false,
            )
            .await;
            return;
        }

        if let Some(session) = self.session.as_mut()
            && session
                .apply_transition(CallTransition::LocalDescriptionSent)
                .is_ok()
        {
            self.emit_state();
            self.ensure_monitor();
        }
    }

    /// Flush candidates queued before the description, in arrival order.
    /// Each is applied exactly once.
    async fn flush_candidates(&mut self, peer: Arc<dyn PeerSession>) {
        let queued = {
            let Some(session) = self.session.as_mut() else { return };
            session.remote_description_applied = true;
            session.drain_candidates()
        };
        for candidate in queued {
            if let Err(e) = peer.add_remote_candidate(candidate).await {
                warn!(target: "Calls/Manager", "Failed to apply queued candidate: {e}");
            }
        }
    }

    // ==================== monitors ====================

    fn ensure_monitor(&mut self) {
        if self.monitor.is_some() {
            return;
        }
        let Some(renderer) = self.config.renderer.clone() else { return };
        let Some(session) = &self.session else { return };
        self.monitor = Some(ConnectionHealthMonitor::spawn(
            session.id.clone(),
            self.config.monitor.clone(),
            renderer,
            self.events.clone(),
        ));
    }

    fn start_quality_sampler(&mut self) {
        if self.quality_stop.is_some() {
            return;
        }
        let Some(peer) = self.peer.clone() else { return };
        let Some(session) = &self.session else { return };

        let (tx, mut rx) = mpsc::channel(8);
        let stop = NetworkQualityController::spawn(
            session.id.clone(),
            self.config.quality.clone(),
            peer,
            tx,
        );
        self.quality_stop = Some(stop);

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(observation) = rx.recv().await {
                if cmd_tx.send(Command::Quality(observation)).await.is_err() {
                    return;
                }
            }
        });
    }

    async fn handle_quality(&mut self, observation: QualityObservation) {
        let (suppress, reenable, quality, call_id) = {
            let Some(session) = self.session.as_mut() else { return };
            if session.id != observation.call_id || !session.state.is_active() {
                return;
            }
            let suppressed = session.quality.video_suppressed;
            session.quality = observation.state;
            session.quality.video_suppressed = suppressed;

            let action = self
                .suppression
                .observe(observation.state.level, &self.config.quality.thresholds);
            let suppress = action == Some(SuppressionAction::SuppressVideo);
            if suppress {
                session.quality.video_suppressed = true;
                let _ = session.apply_transition(CallTransition::VideoStateChanged { off: true });
            }
            (
                suppress,
                action == Some(SuppressionAction::OfferReenable),
                session.quality,
                session.id.clone(),
            )
        };

        if suppress {
            info!(
                target: "Calls/Manager",
                "Sustained poor network on call {call_id}, forcing audio-only"
            );
            if let Some(peer) = self.peer.clone()
                && let Err(e) = peer.set_video_enabled(false).await
            {
                warn!(target: "Calls/Manager", "Failed to suppress video: {e}");
            }
            self.emit_state();
        }

        let _ = self.events.quality.send(Arc::new(QualityChanged {
            call_id,
            state: quality,
            reenable_available: reenable,
        }));
    }

    // ==================== lifecycle plumbing ====================

    fn arm_timeout(&self, call_id: CallId, stage: TimeoutStage, duration: Duration) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = cmd_tx.send(Command::Timeout { call_id, stage }).await;
        });
    }

    async fn handle_timeout(&mut self, call_id: CallId, stage: TimeoutStage) {
        let transition = {
            let Some(session) = self.session.as_ref() else { return };
            if session.id != call_id || !session.is_live() {
                return;
            }
            match (stage, &session.state) {
                (TimeoutStage::Ring, CallState::Ringing { .. }) => CallTransition::RingTimeout,
                (TimeoutStage::Offer, CallState::Offering { .. }) => CallTransition::OfferTimeout,
                (
                    TimeoutStage::Connect,
                    CallState::Connecting { .. } | CallState::Answering { .. },
                ) => CallTransition::ConnectTimeout,
                // The call moved on before the timer fired.
                _ => return,
            }
        };
        info!(target: "Calls/Manager", "Call {call_id} timed out in stage {stage:?}");
        self.end_session(transition, true).await;
    }

    /// Apply a terminal transition and tear the call down: exactly-once end
    /// signaling, monitor shutdown, transport close, archiving, events.
    async fn end_session(&mut self, transition: CallTransition, locally_initiated: bool) {
        {
            let Some(session) = self.session.as_mut() else { return };
            if session.apply_transition(transition).is_err() {
                // Protocol anomaly (e.g. duplicate terminal input),
                // absorbed silently.
                return;
            }
        }
        let Some(mut session) = self.session.take() else { return };
        let reason = session.end_reason().unwrap_or(EndReason::RemoteEnded);

        if locally_initiated && !session.end_signal_sent && reason != EndReason::RelayUnavailable
        {
            session.end_signal_sent = true;
            let msg = match reason {
                EndReason::Declined | EndReason::RingTimeout => SignalingMessage::call_rejected(
                    session.id.clone(),
                    self.device_id.clone(),
                    session.peer().clone(),
                    self.channel.clone(),
                    reason,
                ),
                _ => SignalingMessage::end_call(
                    session.id.clone(),
                    self.device_id.clone(),
                    session.peer().clone(),
                    self.channel.clone(),
                    reason,
                ),
            };
            if let Err(e) = self
                .relay
                .publish(&self.channel, Envelope::Signaling(msg))
                .await
            {
                // The peer will sit stale until its own timeout fires.
                warn!(target: "Calls/Manager", "Failed to publish terminal message: {e}");
            }
        }

        self.release_call_resources();

        let duration_secs = match &session.state {
            CallState::Ended { duration_secs, .. } => *duration_secs,
            _ => None,
        };
        let record = super::ledger::CallRecord {
            call_id: session.id.clone(),
            peer: session.peer().clone(),
            kind: session.kind,
            role: session.role,
            outcome: reason.outcome(),
            reason,
            answered: session.answered,
            started_at: session.started_at,
            ended_at: session.ended_at.unwrap_or_else(Utc::now),
            duration_secs,
            quality: session.quality,
        };
        if let Some((conversation, counters)) = self.ledger.record_call(record).await {
            let _ = self.events.badges.send(Arc::new(BadgeChanged {
                conversation,
                counters,
            }));
        }

        info!(
            target: "Calls/Manager",
            "Call {} ended: {} ({:?})", session.id, reason, reason.outcome()
        );
        let _ = self.events.call_ended.send(Arc::new(CallEnded {
            call_id: session.id.clone(),
            reason,
            outcome: reason.outcome(),
            message: reason.user_message(),
            duration_secs,
        }));
    }

    /// Stop monitors and release the transport. No monitor outlives its
    /// session.
    fn release_call_resources(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop.notify_one();
        }
        if let Some(stop) = self.quality_stop.take() {
            stop.notify_one();
        }
        if let Some(peer) = self.peer.take() {
            tokio::spawn(async move { peer.close().await });
        }
        self.reset_call_scratch();
    }

    fn reset_call_scratch(&mut self) {
        self.pending_remote_description = None;
        self.local_offer = None;
        self.offer_published = false;
        self.suppression = SuppressionPolicy::new();
    }

    fn emit_state(&self) {
        if let Some(session) = &self.session {
            let _ = self.events.call_state.send(Arc::new(CallStateChanged {
                call_id: session.id.clone(),
                state: session.state.clone(),
            }));
        }
    }
}
