//! # Topic Pub/Sub
//!
//! Outbound event sink shared by the approval gate and the status
//! broadcaster. Topics are `{session}/{name}`; the session component keeps
//! concurrent workflows from seeing each other's traffic.
//!
//! ```text
//! ApprovalBroker ──┐
//!                  ├──▶ EventSink::publish(topic, payload) ──▶ TopicHub ──▶ subscribers
//! StatusBroadcaster┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::PublishError;

/// Progress topic suffix
pub const STATUS_UPDATE: &str = "status_update";

/// Build a session-scoped topic
pub fn session_topic(session: &str, name: &str) -> String {
    format!("{session}/{name}")
}

/// Split a topic into `(session, name)`; the session may itself contain `/`
pub fn split_topic(topic: &str) -> Option<(&str, &str)> {
    topic
        .rsplit_once('/')
        .filter(|(session, name)| !session.is_empty() && !name.is_empty())
}

/// A message on a topic, as carried over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEvent {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

/// Outbound half of the pub/sub transport
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PublishError>;
}

/// In-process broadcast hub
///
/// Publishing with no subscribers succeeds; a subscriber that falls behind
/// loses the oldest events rather than slowing the publisher.
#[derive(Debug, Clone)]
pub struct TopicHub {
    tx: broadcast::Sender<TopicEvent>,
}

impl Default for TopicHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TopicHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl EventSink for TopicHub {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PublishError> {
        let event = TopicEvent {
            topic: topic.to_string(),
            payload,
        };
        // SendError only means nobody is listening right now
        if self.tx.send(event).is_err() {
            tracing::trace!(topic, "no subscribers");
        }
        Ok(())
    }
}
