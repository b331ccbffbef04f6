//! Realtime event push channel (spec §6 "Realtime event contract").
//!
//! Grounded on the teacher's `StreamHub` (`kernel/stream_hub.rs`): a
//! topic-keyed, in-process `tokio::sync::broadcast` hub. Here the topic is a
//! user id — each user gets its own broadcast channel, created lazily on
//! first publish or subscribe.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl RealtimeEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Trait port so components depend on the behavior, not this concrete hub.
#[async_trait::async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn publish(&self, user_id: &str, event: RealtimeEvent);
}

#[derive(Default)]
pub struct StreamHub {
    topics: RwLock<HashMap<String, broadcast::Sender<RealtimeEvent>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, user_id: &str) -> broadcast::Receiver<RealtimeEvent> {
        let topics = self.topics.read().await;
        if let Some(tx) = topics.get(user_id) {
            return tx.subscribe();
        }
        drop(topics);

        let mut topics = self.topics.write().await;
        let tx = topics
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        tx.subscribe()
    }
}

#[async_trait::async_trait]
impl RealtimeChannel for StreamHub {
    /// No-op if nobody is subscribed to this user's topic yet — realtime
    /// push is best-effort, not a durable log.
    async fn publish(&self, user_id: &str, event: RealtimeEvent) {
        let topics = self.topics.read().await;
        if let Some(tx) = topics.get(user_id) {
            let _ = tx.send(event);
        }
    }
}

pub fn shared() -> Arc<StreamHub> {
    Arc::new(StreamHub::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let hub = StreamHub::new();
        let mut rx = hub.subscribe("user-1").await;
        hub.publish("user-1", RealtimeEvent::new("sync_started", json!({}))).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "sync_started");
    }

    #[tokio::test]
    async fn publish_to_unsubscribed_topic_is_a_no_op() {
        let hub = StreamHub::new();
        hub.publish("nobody-home", RealtimeEvent::new("sync_started", json!({}))).await;
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let hub = StreamHub::new();
        let mut rx_a = hub.subscribe("user-a").await;
        let _rx_b = hub.subscribe("user-b").await;
        hub.publish("user-b", RealtimeEvent::new("email.classified", json!({}))).await;
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), rx_a.recv())
            .await
            .is_err());
    }
}
