//! Announce delivery
//!
//! Announces reach the ingester from two directions: a subscription on the
//! announce topic (gossip, abstracted behind [`AnnounceSource`]) and the
//! direct HTTP endpoint on the ingest server. Both feed the same queue.
//!
//! The in-process [`AnnounceBus`] implements the topic for tests and for
//! single-process deployments; a libp2p-backed source can be attached the
//! same way.

use async_trait::async_trait;
use sextant_core::schema::Announce;
use sextant_core::PeerId;
use std::fmt::Debug;
use tokio::sync::broadcast;

/// Default announce topic.
pub const DEFAULT_TOPIC: &str = "/indexer/ingest/mainnet";

/// An announce together with the publisher that sent it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnounceEvent {
    pub publisher: PeerId,
    pub announce: Announce,
}

/// A stream of announce events from the topic.
#[async_trait]
pub trait AnnounceSource: Debug + Send {
    /// Receive the next announce, or `None` when the source is closed.
    async fn recv(&mut self) -> Option<AnnounceEvent>;
}

/// In-process announce topic.
#[derive(Debug, Clone)]
pub struct AnnounceBus {
    topic: String,
    tx: broadcast::Sender<AnnounceEvent>,
}

impl AnnounceBus {
    pub fn new(topic: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            topic: topic.into(),
            tx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish an announce to all subscribers. Returns the subscriber
    /// count; zero means nobody was listening.
    pub fn publish(&self, event: AnnounceEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for AnnounceBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC)
    }
}

/// Subscription handle on an [`AnnounceBus`].
#[derive(Debug)]
pub struct BusSubscription {
    rx: broadcast::Receiver<AnnounceEvent>,
}

#[async_trait]
impl AnnounceSource for BusSubscription {
    async fn recv(&mut self) -> Option<AnnounceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Announce subscription lagging, dropped messages");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use sextant_core::link::cid_for_data;

    fn event(seed: u8) -> AnnounceEvent {
        AnnounceEvent {
            publisher: PeerId::from_signing_key(&SigningKey::from_bytes(&[seed; 32])),
            announce: Announce {
                cid: cid_for_data(0x71, &[seed]),
                addrs: vec!["http://127.0.0.1:3201".to_string()],
            },
        }
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = AnnounceBus::default();
        let mut sub = bus.subscribe();

        assert_eq!(bus.publish(event(1)), 1);
        let got = sub.recv().await.unwrap();
        assert_eq!(got, event(1));
    }

    #[tokio::test]
    async fn test_bus_with_no_subscribers() {
        let bus = AnnounceBus::new("/indexer/ingest/testnet");
        assert_eq!(bus.topic(), "/indexer/ingest/testnet");
        assert_eq!(bus.publish(event(1)), 0);
    }
}
