//! # Status Broadcaster
//!
//! Keeps the latest progress message alive on `{session}/status_update` by
//! republishing it until it is replaced or stopped. Late subscribers see the
//! current status within one interval.
//!
//! At most one republish loop exists at a time. `set_message` holds the slot
//! lock while it stops and joins the old loop, so two publishers never
//! interleave and nothing is published under the old topic after it returns.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::pubsub::EventSink;

/// Default republish interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

struct ActiveLoop {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct BroadcastSlot {
    message: String,
    topic: Option<String>,
    active: Option<ActiveLoop>,
}

/// Single-value mailbox republished on a topic
pub struct StatusBroadcaster {
    sink: Arc<dyn EventSink>,
    interval: Duration,
    slot: Mutex<BroadcastSlot>,
}

impl StatusBroadcaster {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::with_interval(sink, DEFAULT_INTERVAL)
    }

    pub fn with_interval(sink: Arc<dyn EventSink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            slot: Mutex::new(BroadcastSlot::default()),
        }
    }

    /// Replace the current message and restart the republish loop
    ///
    /// `topic = None` keeps the previous topic. With no topic ever set the
    /// loop idles without publishing.
    pub async fn set_message(&self, message: impl Into<String>, topic: Option<String>) {
        let mut slot = self.slot.lock().await;
        shutdown(&mut slot).await;

        slot.message = message.into();
        if topic.is_some() {
            slot.topic = topic;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(republish(
            self.sink.clone(),
            slot.message.clone(),
            slot.topic.clone(),
            self.interval,
            stop_rx,
        ));
        slot.active = Some(ActiveLoop { stop_tx, handle });
    }

    /// Stop the loop and wait for it; a no-op when idle
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        shutdown(&mut slot).await;
    }

    pub async fn current_message(&self) -> String {
        self.slot.lock().await.message.clone()
    }

    pub async fn current_topic(&self) -> Option<String> {
        self.slot.lock().await.topic.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.slot.lock().await.active.is_some()
    }
}

async fn shutdown(slot: &mut BroadcastSlot) {
    if let Some(active) = slot.active.take() {
        let _ = active.stop_tx.send(());
        if let Err(e) = active.handle.await {
            tracing::warn!("status loop ended abnormally: {}", e);
        }
    }
}

async fn republish(
    sink: Arc<dyn EventSink>,
    message: String,
    topic: Option<String>,
    interval: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        if let Some(topic) = topic.as_deref() {
            if let Err(e) = sink.publish(topic, json!({ "message": message })).await {
                tracing::debug!(topic, "status publish failed: {}", e);
            }
        }

        tokio::select! {
            _ = &mut stop_rx => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

impl Drop for StatusBroadcaster {
    fn drop(&mut self) {
        if let Some(active) = self.slot.get_mut().active.take() {
            active.handle.abort();
        }
    }
}
