//! WebSocket relay client.
//!
//! Speaks the relay service's JSON frame protocol: the client sends
//! `subscribe` and `publish` frames, the service echoes every published
//! envelope to all channel subscribers with its own receive timestamp.
//! A read pump fans frames into per-channel queues; an unexpected disconnect
//! triggers a bounded reconnect with backoff, re-subscribing the channels
//! that were active.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use kincore::channel::ChannelName;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Delivery, Envelope, RelayError, Result, SignalingChannel};
use async_trait::async_trait;

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const SUBSCRIPTION_QUEUE: usize = 64;

/// Frames sent by this client.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Subscribe { channel: &'a ChannelName },
    Publish {
        channel: &'a ChannelName,
        envelope: &'a Envelope,
    },
}

/// Frames delivered by the service.
#[derive(Debug, Deserialize)]
struct ServerFrame {
    channel: ChannelName,
    /// Stamped by the relay on receipt. Advisory only.
    #[serde(default)]
    server_ts: Option<DateTime<Utc>>,
    envelope: Envelope,
}

#[derive(Debug, Clone)]
pub struct WebSocketRelayConfig {
    pub url: String,
    /// Reconnect attempts after an unexpected disconnect before giving up.
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl WebSocketRelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(500),
        }
    }
}

pub struct WebSocketRelay {
    config: WebSocketRelayConfig,
    ws_sink: Arc<Mutex<Option<WsSink>>>,
    subscriptions: Arc<DashMap<String, mpsc::Sender<Delivery>>>,
    is_connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl WebSocketRelay {
    pub fn new(config: WebSocketRelayConfig) -> Self {
        Self {
            config,
            ws_sink: Arc::new(Mutex::new(None)),
            subscriptions: Arc::new(DashMap::new()),
            is_connected: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    /// Dial the relay and start the read pump.
    ///
    /// Returns a boxed future rather than an `async fn` opaque type: the
    /// reconnect path recurses back into `connect`, and an explicit boxed
    /// `Send` future breaks the opaque-type inference cycle.
    pub fn connect<'a>(
        self: &'a Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            if this.is_connected() {
                return Ok(());
            }
            this.closed.store(false, Ordering::Relaxed);
            info!(target: "Relay/Ws", "Dialing {}", this.config.url);
            let (ws, _response) = connect_async(this.config.url.as_str())
                .await
                .map_err(|e| RelayError::Unavailable(e.to_string()))?;

            let (sink, stream) = ws.split();
            *this.ws_sink.lock().await = Some(sink);
            this.is_connected.store(true, Ordering::Relaxed);

            // Re-announce any channels that survived a reconnect.
            let channels: Vec<String> = this
                .subscriptions
                .iter()
                .map(|entry| entry.key().clone())
                .collect();
            for channel in channels {
                this.send_frame(&ClientFrame::Subscribe {
                    channel: &ChannelName::from_raw(channel),
                })
                .await?;
            }

            tokio::spawn(Self::read_pump(Arc::clone(&this), stream));
            Ok(())
        })
    }

    /// Stop the relay client. Pending subscriptions end their streams.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
        self.is_connected.store(false, Ordering::Relaxed);
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            let _ = sink.close().await;
        }
        self.subscriptions.clear();
    }

    async fn send_frame(&self, frame: &ClientFrame<'_>) -> Result<()> {
        let json =
            serde_json::to_string(frame).map_err(|e| RelayError::Serialization(e.to_string()))?;
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| RelayError::Unavailable("not connected".to_string()))?;
        sink.send(Message::text(json)).await.map_err(|e| {
            self.is_connected.store(false, Ordering::Relaxed);
            RelayError::Unavailable(e.to_string())
        })
    }

    async fn read_pump(relay: Arc<Self>, mut stream: WsStream) {
        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = relay.shutdown.notified() => {
                    debug!(target: "Relay/Ws", "Shutdown signaled, exiting read pump");
                    return;
                }
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame: ServerFrame = match serde_json::from_str(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(target: "Relay/Ws", "Dropping unparseable frame: {e}");
                            continue;
                        }
                    };
                    relay.route(frame).await;
                }
                Some(Ok(msg)) if msg.is_close() => {
                    warn!(target: "Relay/Ws", "Relay closed the connection");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(target: "Relay/Ws", "WebSocket error: {e}");
                    break;
                }
                None => {
                    debug!(target: "Relay/Ws", "WebSocket stream ended");
                    break;
                }
            }
        }

        relay.is_connected.store(false, Ordering::Relaxed);
        *relay.ws_sink.lock().await = None;
        if !relay.closed.load(Ordering::Relaxed) {
            tokio::spawn(Self::reconnect_loop(relay));
        }
    }

    async fn route(&self, frame: ServerFrame) {
        let key = frame.channel.as_str().to_string();
        // Clone the sender out so no map guard is held across the await.
        let Some(tx) = self.subscriptions.get(&key).map(|entry| entry.value().clone()) else {
            return;
        };
        let delivery = Delivery {
            envelope: frame.envelope,
            server_ts: frame.server_ts,
        };
        if tx.send(delivery).await.is_err() {
            self.subscriptions.remove(&key);
            debug!(target: "Relay/Ws", "Subscriber for {key} dropped, unsubscribing");
        }
    }

    async fn reconnect_loop(relay: Arc<Self>) {
        for attempt in 1..=relay.config.max_reconnect_attempts {
            if relay.closed.load(Ordering::Relaxed) {
                return;
            }
            let backoff = relay.config.reconnect_base_delay * 2u32.saturating_pow(attempt - 1);
            let jitter = Duration::from_millis(rand::rng().random_range(0..250));
            tokio::select! {
                _ = tokio::time::sleep(backoff + jitter) => {}
                _ = relay.shutdown.notified() => return,
            }

            match relay.connect().await {
                Ok(()) => {
                    info!(target: "Relay/Ws", "Reconnected after {attempt} attempt(s)");
                    return;
                }
                Err(e) => {
                    warn!(
                        target: "Relay/Ws",
                        "Reconnect attempt {attempt}/{} failed: {e}",
                        relay.config.max_reconnect_attempts
                    );
                }
            }
        }
        warn!(target: "Relay/Ws", "Giving up on reconnecting; publishes will fail until connect() is called again");
    }
}

#[async_trait]
impl SignalingChannel for WebSocketRelay {
    async fn subscribe(&self, channel: &ChannelName) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        self.subscriptions
            .insert(channel.as_str().to_string(), tx);
        self.send_frame(&ClientFrame::Subscribe { channel }).await?;
        Ok(rx)
    }

    async fn publish(&self, channel: &ChannelName, envelope: Envelope) -> Result<()> {
        self.send_frame(&ClientFrame::Publish {
            channel,
            envelope: &envelope,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::signaling::SignalingMessage;
    use futures_util::{SinkExt, StreamExt};
    use kincore::channel::family_channel;
    use kincore::types::{CallId, CallKind, DeviceId};
    use tokio::net::TcpListener;

    /// Minimal relay service: stamps frames and echoes publishes back to the
    /// single connected client.
    async fn spawn_echo_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let (mut sink, mut stream) = ws.split();
            while let Some(Ok(msg)) = stream.next().await {
                let Message::Text(text) = msg else { continue };
                let frame: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["op"] == "publish" {
                    let out = serde_json::json!({
                        "channel": frame["channel"],
                        "server_ts": Utc::now(),
                        "envelope": frame["envelope"],
                    });
                    sink.send(Message::text(out.to_string())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_publish_roundtrips_through_relay() {
        let url = spawn_echo_relay().await;
        let relay = Arc::new(WebSocketRelay::new(WebSocketRelayConfig::new(url)));
        relay.connect().await.unwrap();

        let channel = family_channel("fam1");
        let mut rx = relay.subscribe(&channel).await.unwrap();

        let msg = SignalingMessage::call_request(
            CallId::generate(),
            DeviceId::from("guardian-1"),
            DeviceId::from("child-1"),
            channel.clone(),
            CallKind::Voice,
        );
        relay
            .publish(&channel, Envelope::Signaling(msg.clone()))
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope, Envelope::Signaling(msg));
        assert!(delivery.server_ts.is_some());

        relay.close().await;
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_unavailable() {
        let relay = Arc::new(WebSocketRelay::new(WebSocketRelayConfig::new(
            "ws://127.0.0.1:1",
        )));
        let err = relay
            .publish(&family_channel("fam1"), Envelope::Unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unavailable(_)));
    }
}
