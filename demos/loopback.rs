//! Loopback demo: a guardian and a child device on one in-memory relay.
//!
//! The child auto-accepts the guardian's voice call, both coordinators run
//! the full signaling exchange, and the demo transport reports connected as
//! soon as the remote description lands.
//!
//! Run with: cargo run --example loopback

use async_trait::async_trait;
use kinlink::calls::ledger::{CallLedger, LedgerConfig};
use kinlink::calls::manager::{CallManager, CallManagerConfig};
use kinlink::calls::signaling::{IceCandidate, SessionDescription};
use kinlink::relay::InMemoryRelay;
use kinlink::store::MemoryStore;
use kinlink::transport::{PeerSession, PeerTransport, TransportError, TransportEvent};
use kinlink::traversal::{TraversalConfig, TraversalResolver, TraversalServerConfig};
use kinlink::types::{CallKind, ConnectionType, DeviceId, TransportStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

struct DemoSession {
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

#[async_trait]
impl PeerSession for DemoSession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer("v=0 demo"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::answer("v=0 demo"))
    }

    async fn set_remote_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), TransportError> {
        // With both descriptions in place this loopback "connects".
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let _ = events
                .send(TransportEvent::LocalCandidate(IceCandidate::new(
                    "candidate:1 1 UDP 2130706431 127.0.0.1 9 typ host",
                )))
                .await;
            let _ = events.send(TransportEvent::Connected).await;
        });
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        Ok(())
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().await.take()
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        Ok(TransportStats {
            latency_ms: 12.0,
            jitter_ms: 2.0,
            packet_loss_pct: 0.0,
            estimated_bandwidth_kbps: 8_000.0,
        })
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Ethernet
    }

    async fn set_video_enabled(&self, _enabled: bool) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {}
}

struct DemoTransport;

#[async_trait]
impl PeerTransport for DemoTransport {
    async fn open(
        &self,
        servers: Vec<TraversalServerConfig>,
        _kind: CallKind,
    ) -> Result<Arc<dyn PeerSession>, TransportError> {
        println!("transport opened with {} traversal servers", servers.len());
        let (tx, rx) = mpsc::channel(16);
        Ok(Arc::new(DemoSession {
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
        }))
    }
}

async fn spawn_device(relay: Arc<InMemoryRelay>, device: &str) -> Arc<CallManager> {
    let ledger = CallLedger::load(LedgerConfig::default(), Arc::new(MemoryStore::new()))
        .await
        .expect("in-memory ledger");
    CallManager::spawn(
        DeviceId::from(device),
        "demo-family",
        CallManagerConfig::default(),
        relay,
        Arc::new(DemoTransport),
        Arc::new(TraversalResolver::with_http(TraversalConfig::default())),
        ledger,
    )
    .await
    .expect("spawn coordinator")
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let relay = Arc::new(InMemoryRelay::new());
    let guardian = spawn_device(relay.clone(), "guardian-1").await;
    let child = spawn_device(relay, "child-1").await;

    // The child answers as soon as it rings.
    let mut ringing = child.events().incoming_call.subscribe();
    let answerer = child.clone();
    tokio::spawn(async move {
        if let Ok(call) = ringing.recv().await {
            println!(
                "child: incoming {:?} call from {}",
                call.meta.kind, call.meta.peer
            );
            answerer.accept_call().await.expect("accept");
        }
    });

    let mut guardian_states = guardian.events().call_state.subscribe();
    guardian
        .start_call(DeviceId::from("child-1"), CallKind::Voice)
        .await
        .expect("start call");

    while let Ok(state) = guardian_states.recv().await {
        println!("guardian: call is {:?}", state.state);
        if state.state.is_active() {
            break;
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    guardian.hang_up().await.expect("hang up");
    tokio::time::sleep(Duration::from_millis(200)).await;

    for record in guardian.ledger().history().await {
        println!(
            "guardian history: {:?} call with {} ended {:?} ({}s)",
            record.kind,
            record.peer,
            record.outcome,
            record.duration_secs.unwrap_or(0)
        );
    }

    guardian.shutdown().await;
    child.shutdown().await;
}
