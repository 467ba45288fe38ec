//! In-process relay for tests and loopback use.
//!
//! Mirrors the external service's contract: named channels, broadcast to
//! every subscriber (including the publisher), at-least-once delivery. The
//! chaos knobs let tests exercise duplication and publish failure without a
//! network.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use kincore::channel::ChannelName;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};

use super::{Delivery, Envelope, RelayError, Result, SignalingChannel};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
pub struct InMemoryRelay {
    channels: DashMap<String, broadcast::Sender<Delivery>>,
    /// When set, every publish fails with `RelayError::Unavailable`.
    fail_publishes: AtomicBool,
    /// When set, every publish is delivered twice (at-least-once chaos).
    duplicate_deliveries: AtomicBool,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::Relaxed);
    }

    pub fn set_duplicate_deliveries(&self, duplicate: bool) {
        self.duplicate_deliveries.store(duplicate, Ordering::Relaxed);
    }

    fn sender_for(&self, channel: &ChannelName) -> broadcast::Sender<Delivery> {
        self.channels
            .entry(channel.as_str().to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl SignalingChannel for InMemoryRelay {
    async fn subscribe(&self, channel: &ChannelName) -> Result<mpsc::Receiver<Delivery>> {
        let mut broadcast_rx = self.sender_for(channel).subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(delivery) => {
                        if tx.send(delivery).await.is_err() {
                            return;
                        }
                    }
                    // A lagged subscriber loses messages, like the real
                    // service under backpressure; delivery is best-effort
                    // beyond at-least-once for live subscribers.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    async fn publish(&self, channel: &ChannelName, envelope: Envelope) -> Result<()> {
        if self.fail_publishes.load(Ordering::Relaxed) {
            return Err(RelayError::Unavailable("relay offline".to_string()));
        }

        let delivery = Delivery {
            envelope,
            server_ts: Some(Utc::now()),
        };
        let sender = self.sender_for(channel);
        // No subscribers is not a publish failure.
        let _ = sender.send(delivery.clone());
        if self.duplicate_deliveries.load(Ordering::Relaxed) {
            let _ = sender.send(delivery);
        }
        Ok(())
    }
}
