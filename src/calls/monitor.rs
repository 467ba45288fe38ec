//! Connection health monitoring and media recovery.
//!
//! Watches the live renderer and its track for two observed failure modes:
//! a track the transport reports live while the renderer never produces
//! data, and playback silently blocked by autoplay policy. Recovery is
//! strictly corrective (replay, reattach, muted retry) with bounded
//! attempts; the monitor never terminates the call. Only the coordinator
//! ends a session.

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::interval;

use crate::transport::MediaTrack;
use crate::types::events::{EventBus, HealthChanged};
use kincore::types::CallId;

/// Pacing and bounds for the recovery loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Fixed evaluation interval.
    pub check_interval: Duration,
    /// How long the renderer may sit at zero readiness before recovery
    /// actions start.
    pub stall_window: Duration,
    /// Replay (stop, reload, replay) attempts per stall.
    pub max_replays: u32,
    /// Hard re-attach (detach then attach) attempts per stall.
    pub max_reattaches: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(500),
            stall_window: Duration::from_secs(2),
            max_replays: 3,
            max_reattaches: 2,
        }
    }
}

/// Observable connection-health flag for the live call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Ok,
    /// A corrective action (replay/reattach) is in progress.
    Recovering,
    /// Autoplay is blocked and the muted retry failed; a user gesture is
    /// required to start playback.
    TapToRetry,
    /// Unrecoverable playback error; auto-retries stopped.
    Error,
}

/// Renderer media pipeline readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Nothing decoded yet.
    NoData,
    /// Stream metadata only, no renderable frames.
    Metadata,
    /// Renderable data is flowing.
    Ready,
}

#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    /// The platform refused unmuted autoplay; a muted retry may succeed.
    #[error("autoplay blocked by policy")]
    AutoplayBlocked,

    #[error("media decode failed: {0}")]
    Decode(String),

    #[error("playback failed: {0}")]
    Other(String),
}

/// Renderer lifecycle notifications.
#[derive(Debug, Clone)]
pub enum RendererEvent {
    Playing,
    Stalled,
    Failed(PlaybackError),
}

/// Capability seam over the media runtime. The monitor is written against
/// this interface, not a concrete renderer.
#[async_trait]
pub trait MediaRenderer: Send + Sync {
    async fn attach(&self, track: Arc<dyn MediaTrack>);
    async fn detach(&self);
    fn readiness(&self) -> Readiness;
    fn is_playing(&self) -> bool;
    async fn play(&self) -> Result<(), PlaybackError>;
    async fn stop(&self);
    async fn reload(&self);
    async fn set_muted(&self, muted: bool);
    /// Renderer state-change notifications.
    fn state_changes(&self) -> broadcast::Receiver<RendererEvent>;
}

/// Handles used by the coordinator to feed and stop a running monitor.
pub struct MonitorHandle {
    pub tracks: mpsc::Sender<Arc<dyn MediaTrack>>,
    pub retry: mpsc::Sender<()>,
    pub stop: Arc<Notify>,
}

struct RecoveryState {
    track: Option<Arc<dyn MediaTrack>>,
    no_data_since: Option<Instant>,
    replays: u32,
    reattaches: u32,
    health: HealthState,
    /// Set when auto-retrying has stopped; cleared by a user gesture.
    halted: bool,
}

pub struct ConnectionHealthMonitor {
    call_id: CallId,
    config: MonitorConfig,
    renderer: Arc<dyn MediaRenderer>,
    events: Arc<EventBus>,
    tracks_rx: mpsc::Receiver<Arc<dyn MediaTrack>>,
    retry_rx: mpsc::Receiver<()>,
    stop: Arc<Notify>,
}

impl ConnectionHealthMonitor {
    /// Spawn a monitor for one call. It runs until `stop` is notified; no
    /// monitor outlives its session.
    pub fn spawn(
        call_id: CallId,
        config: MonitorConfig,
        renderer: Arc<dyn MediaRenderer>,
        events: Arc<EventBus>,
    ) -> MonitorHandle {
        let (tracks_tx, tracks_rx) = mpsc::channel(4);
        let (retry_tx, retry_rx) = mpsc::channel(4);
        let stop = Arc::new(Notify::new());

        let monitor = Self {
            call_id,
            config,
            renderer,
            events,
            tracks_rx,
            retry_rx,
            stop: stop.clone(),
        };
        tokio::spawn(monitor.run());

        MonitorHandle {
            tracks: tracks_tx,
            retry: retry_tx,
            stop,
        }
    }

    async fn run(mut self) {
        let mut renderer_events = self.renderer.state_changes();
        let mut ticker = interval(self.config.check_interval);
        let mut rs = RecoveryState {
            track: None,
            no_data_since: None,
            replays: 0,
            reattaches: 0,
            health: HealthState::Ok,
            halted: false,
        };

        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    debug!(target: "Calls/Health", "Monitor for call {} stopped", self.call_id);
                    return;
                }
                _ = ticker.tick() => {
                    if !rs.halted {
                        self.check(&mut rs).await;
                    }
                }
                Some(track) = self.tracks_rx.recv() => {
                    self.renderer.attach(track.clone()).await;
                    rs.track = Some(track);
                    rs.no_data_since = None;
                    self.try_play(&mut rs).await;
                }
                Ok(event) = renderer_events.recv() => {
                    self.on_renderer_event(&mut rs, event).await;
                }
                Some(()) = self.retry_rx.recv() => {
                    self.on_user_retry(&mut rs).await;
                }
            }
        }
    }

    /// Periodic evaluation. Also triggered by renderer stall events.
    async fn check(&self, rs: &mut RecoveryState) {
        // Nothing to recover before the first track arrives.
        if rs.track.is_none() {
            return;
        }

        if self.renderer.readiness() == Readiness::Ready {
            rs.no_data_since = None;
            rs.replays = 0;
            rs.reattaches = 0;
            self.set_health(rs, HealthState::Ok);
            return;
        }

        let stalled_for = rs.no_data_since.get_or_insert_with(Instant::now).elapsed();
        if stalled_for < self.config.stall_window {
            return;
        }

        // The renderer claims to be playing but has produced nothing:
        // reset it (stop, reload, replay), bounded.
        if self.renderer.is_playing() && rs.replays < self.config.max_replays {
            rs.replays += 1;
            debug!(
                target: "Calls/Health",
                "Call {}: renderer stalled while playing, replay {}/{}",
                self.call_id, rs.replays, self.config.max_replays
            );
            self.set_health(rs, HealthState::Recovering);
            self.renderer.stop().await;
            self.renderer.reload().await;
            self.try_play(rs).await;
            rs.no_data_since = Some(Instant::now());
            return;
        }

        // The track is live and enabled but the renderer still has no data:
        // force a hard re-attach, bounded.
        let track_usable = rs
            .track
            .as_ref()
            .map(|t| t.is_live() && t.is_enabled())
            .unwrap_or(false);
        if track_usable && rs.reattaches < self.config.max_reattaches {
            if let Some(track) = rs.track.clone() {
                rs.reattaches += 1;
                debug!(
                    target: "Calls/Health",
                    "Call {}: forcing track re-attach {}/{}",
                    self.call_id, rs.reattaches, self.config.max_reattaches
                );
                self.set_health(rs, HealthState::Recovering);
                self.renderer.detach().await;
                self.renderer.attach(track).await;
                self.try_play(rs).await;
                rs.no_data_since = Some(Instant::now());
            }
            return;
        }

        warn!(
            target: "Calls/Health",
            "Call {}: playback recovery exhausted, awaiting user gesture", self.call_id
        );
        rs.halted = true;
        self.set_health(rs, HealthState::Error);
    }

    /// Attempt playback, handling the autoplay-policy path: one retry with
    /// audio muted, then an explicit tap-to-retry affordance instead of
    /// looping forever.
    async fn try_play(&self, rs: &mut RecoveryState) {
        match self.renderer.play().await {
            Ok(()) => {}
            Err(PlaybackError::AutoplayBlocked) => {
                debug!(
                    target: "Calls/Health",
                    "Call {}: autoplay blocked, retrying muted", self.call_id
                );
                self.renderer.set_muted(true).await;
                if self.renderer.play().await.is_err() {
                    rs.halted = true;
                    self.set_health(rs, HealthState::TapToRetry);
                }
            }
            Err(e) => {
                warn!(
                    target: "Calls/Health",
                    "Call {}: unrecoverable playback error: {}", self.call_id, e
                );
                rs.halted = true;
                self.set_health(rs, HealthState::Error);
            }
        }
    }

    async fn on_renderer_event(&self, rs: &mut RecoveryState, event: RendererEvent) {
        match event {
            RendererEvent::Playing => {
                rs.no_data_since = None;
                if !rs.halted {
                    self.set_health(rs, HealthState::Ok);
                }
            }
            RendererEvent::Stalled => {
                if !rs.halted {
                    self.check(rs).await;
                }
            }
            RendererEvent::Failed(PlaybackError::AutoplayBlocked) => {
                if !rs.halted {
                    self.try_play(rs).await;
                }
            }
            RendererEvent::Failed(e) => {
                warn!(
                    target: "Calls/Health",
                    "Call {}: renderer reported failure: {}", self.call_id, e
                );
                rs.halted = true;
                self.set_health(rs, HealthState::Error);
            }
        }
    }

    async fn on_user_retry(&self, rs: &mut RecoveryState) {
        debug!(target: "Calls/Health", "Call {}: user retry gesture", self.call_id);
        rs.halted = false;
        rs.replays = 0;
        rs.reattaches = 0;
        rs.no_data_since = None;
        self.renderer.set_muted(false).await;
        self.set_health(rs, HealthState::Recovering);
        self.try_play(rs).await;
    }

    fn set_health(&self, rs: &mut RecoveryState, new: HealthState) {
        if rs.health != new {
            rs.health = new;
            let _ = self.events.health.send(Arc::new(HealthChanged {
                call_id: self.call_id.clone(),
                state: new,
            }));
        }
    }
}
