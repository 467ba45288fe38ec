//! Network quality sampling.
//!
//! While a call is active, the controller pulls transport statistics on a
//! fixed interval, classifies them against the configured thresholds, and
//! reports each observation to the coordinator. It only emits observations;
//! the suppression decision and any session mutation stay with the
//! coordinator.

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::{interval, timeout};

use crate::transport::PeerSession;
use kincore::types::{CallId, NetworkQualityState, QualityThresholds, quality};

/// Pacing for the sampling loop.
#[derive(Debug, Clone)]
pub struct QualityControllerConfig {
    pub sample_interval: Duration,
    /// Upper bound on one stats pull.
    pub stats_timeout: Duration,
    pub thresholds: QualityThresholds,
}

impl Default for QualityControllerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(2),
            stats_timeout: Duration::from_secs(1),
            thresholds: QualityThresholds::default(),
        }
    }
}

/// One classified sample for the coordinator.
#[derive(Debug, Clone)]
pub struct QualityObservation {
    pub call_id: CallId,
    pub state: NetworkQualityState,
}

pub struct NetworkQualityController {
    call_id: CallId,
    config: QualityControllerConfig,
    session: Arc<dyn PeerSession>,
    observations: mpsc::Sender<QualityObservation>,
    stop: Arc<Notify>,
}

impl NetworkQualityController {
    /// Spawn the sampling loop for one active call. Runs until `stop` is
    /// notified or the coordinator goes away.
    pub fn spawn(
        call_id: CallId,
        config: QualityControllerConfig,
        session: Arc<dyn PeerSession>,
        observations: mpsc::Sender<QualityObservation>,
    ) -> Arc<Notify> {
        let stop = Arc::new(Notify::new());
        let controller = Self {
            call_id,
            config,
            session,
            observations,
            stop: stop.clone(),
        };
        tokio::spawn(controller.run());
        stop
    }

    async fn run(self) {
        let mut ticker = interval(self.config.sample_interval);
        // The first tick fires immediately; skip it so sampling starts one
        // interval into the call.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    debug!(target: "Calls/Quality", "Sampler for call {} stopped", self.call_id);
                    return;
                }
                _ = ticker.tick() => {
                    if !self.sample().await {
                        return;
                    }
                }
            }
        }
    }

    /// Take one sample. Returns false when the coordinator is gone.
    async fn sample(&self) -> bool {
        let stats = match timeout(self.config.stats_timeout, self.session.stats()).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                // Transient stats failures are skipped, never surfaced.
                debug!(
                    target: "Calls/Quality",
                    "Call {}: stats unavailable: {}", self.call_id, e
                );
                return true;
            }
            Err(_) => {
                warn!(
                    target: "Calls/Quality",
                    "Call {}: stats pull timed out", self.call_id
                );
                return true;
            }
        };

        let level = quality::classify(&stats, &self.config.thresholds);
        let observation = QualityObservation {
            call_id: self.call_id.clone(),
            state: NetworkQualityState {
                level,
                connection: self.session.connection_type(),
                stats,
                // The coordinator owns the suppression flag and merges it.
                video_suppressed: false,
            },
        };
        self.observations.send(observation).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::signaling::{IceCandidate, SessionDescription};
    use crate::transport::{TransportError, TransportEvent};
    use async_trait::async_trait;
    use kincore::types::{ConnectionType, QualityLevel, TransportStats};
    use std::sync::Mutex;

    struct ScriptedSession {
        stats: Mutex<Vec<Result<TransportStats, TransportError>>>,
    }

    impl ScriptedSession {
        fn new(stats: Vec<Result<TransportStats, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                stats: Mutex::new(stats),
            })
        }
    }

    #[async_trait]
    impl PeerSession for ScriptedSession {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            unimplemented!()
        }
        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            unimplemented!()
        }
        async fn set_remote_description(
            &self,
            _description: SessionDescription,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn add_remote_candidate(
            &self,
            _candidate: IceCandidate,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
            None
        }
        async fn stats(&self) -> Result<TransportStats, TransportError> {
            let mut stats = self.stats.lock().unwrap();
            if stats.is_empty() {
                Ok(TransportStats::default())
            } else {
                stats.remove(0)
            }
        }
        fn connection_type(&self) -> ConnectionType {
            ConnectionType::Wifi
        }
        async fn set_video_enabled(&self, _enabled: bool) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn fast_config() -> QualityControllerConfig {
        QualityControllerConfig {
            sample_interval: Duration::from_millis(20),
            stats_timeout: Duration::from_millis(100),
            thresholds: QualityThresholds::default(),
        }
    }

    fn poor_stats() -> TransportStats {
        TransportStats {
            latency_ms: 600.0,
            jitter_ms: 150.0,
            packet_loss_pct: 12.0,
            estimated_bandwidth_kbps: 100.0,
        }
    }

    #[tokio::test]
    async fn test_samples_are_classified_and_reported() {
        let session = ScriptedSession::new(vec![
            Ok(TransportStats {
                latency_ms: 40.0,
                ..TransportStats::default()
            }),
            Ok(poor_stats()),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        let stop = NetworkQualityController::spawn(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            fast_config(),
            session,
            tx,
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.state.level, QualityLevel::Excellent);
        assert_eq!(first.state.connection, ConnectionType::Wifi);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.state.level, QualityLevel::Poor);
        assert!(!second.state.video_suppressed);

        stop.notify_waiters();
    }

    /// A failed stats pull is skipped; the loop keeps sampling.
    #[tokio::test]
    async fn test_stats_errors_are_skipped() {
        let session = ScriptedSession::new(vec![
            Err(TransportError::Failed("no stats yet".to_string())),
            Ok(poor_stats()),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        let stop = NetworkQualityController::spawn(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            fast_config(),
            session,
            tx,
        );

        let observation = rx.recv().await.unwrap();
        assert_eq!(observation.state.level, QualityLevel::Poor);

        stop.notify_waiters();
    }

    /// Dropping the coordinator side ends the loop.
    #[tokio::test]
    async fn test_loop_exits_when_coordinator_gone() {
        let session = ScriptedSession::new(vec![]);
        let (tx, rx) = mpsc::channel(8);
        let _stop = NetworkQualityController::spawn(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            fast_config(),
            session,
            tx,
        );
        drop(rx);
        // The next sample's failed send ends the task; nothing to assert
        // beyond it not panicking.
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
}
