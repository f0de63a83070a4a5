//! In-process event fan-out.
//!
//! A single broadcast channel carries every core event as a topic-tagged
//! envelope; subscriptions filter on the receiving side. Publishing is
//! synchronous and fire-and-forget: with nobody subscribed the send is a
//! no-op, and a lagged subscriber loses the events it was too slow for
//! (counted on the hub) without ever blocking the producer.
//!
//! Funneling all topics through one channel keeps the hot publish path
//! free of locks and gives diagnostics a single tap: subscribing to
//! [`EventHub::ALL`] yields the interleaved event flow of the whole core.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Topic-tagged event as carried on the wire between components.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Envelope>,
    dropped: Arc<AtomicU64>,
}

impl EventHub {
    /// Subscription filter that matches every topic.
    pub const ALL: &'static str = "";

    /// Default capacity of 1024 in-flight events across all topics.
    pub fn new() -> Self {
        Self::with_capacity(1_024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish a JSON payload under a topic. Never blocks; a send with no
    /// subscribers is dropped silently.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let _ = self.tx.send(Envelope {
            topic: topic.to_string(),
            payload,
        });
    }

    /// Serialize and publish a typed event. Events are advisory, so a
    /// serialization failure is swallowed rather than surfaced.
    pub fn publish_event<T: serde::Serialize>(&self, topic: &str, event: &T) {
        if let Ok(payload) = serde_json::to_value(event) {
            self.publish(topic, payload);
        }
    }

    /// Open a stream over one topic ([`EventHub::ALL`] for everything).
    pub fn subscribe(&self, topic: &str) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            topic: topic.to_string(),
            dropped: self.dropped.clone(),
        }
    }

    /// Events lost to lagged subscribers since the hub was created.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Live subscriptions (all topics share the underlying channel).
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a subscription, filtered to one topic.
pub struct EventStream {
    rx: broadcast::Receiver<Envelope>,
    topic: String,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Next payload on the subscribed topic, or `None` once the hub is
    /// gone. Falling behind skips the missed events (they are counted on
    /// the hub) instead of erroring.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if self.topic == EventHub::ALL || envelope.topic == self.topic {
                        return Some(envelope.payload);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
