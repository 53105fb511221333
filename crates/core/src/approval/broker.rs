//! # Approval Broker
//!
//! Request/response correlation with a human approver over the pub/sub
//! transport.
//!
//! ```text
//! Stage                        ApprovalBroker                  Approver (UI)
//!   │ request_approval(s, kind)      │                               │
//!   ├──────────────────────────────▶ │ register waiter for s         │
//!   │                                ├── publish s/topic_approval ──▶│
//!   │                                │                               │
//!   │                                │ ◀── deliver(s/topic_response) ┤
//!   │ ◀──── Responded(payload) ──────┤ resolve once, deregister      │
//!   │            or TimedOut         │                               │
//! ```
//!
//! The pending entry is removed on every exit path by a guard that checks a
//! per-request ticket, so a stale request never removes a newer one for the
//! same session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ApprovalError;
use crate::pubsub::{session_topic, split_topic, EventSink};

/// Default time to wait for a human decision
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// What is being approved; determines the topic pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Extracted keywords and domains
    Topics,
    /// Planned web search queries
    WebQueries,
}

impl ApprovalKind {
    pub fn request_suffix(&self) -> &'static str {
        match self {
            ApprovalKind::Topics => "topic_approval",
            ApprovalKind::WebQueries => "web_approval",
        }
    }

    pub fn response_suffix(&self) -> &'static str {
        match self {
            ApprovalKind::Topics => "topic_response",
            ApprovalKind::WebQueries => "web_response",
        }
    }

    /// Kind whose request topic ends in `suffix`
    pub fn from_request_suffix(suffix: &str) -> Option<Self> {
        [ApprovalKind::Topics, ApprovalKind::WebQueries]
            .into_iter()
            .find(|kind| kind.request_suffix() == suffix)
    }
}

/// How an approval request ended
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    /// The approver answered with this payload
    Responded(Value),
    /// No answer within the timeout
    TimedOut,
    /// The waiter was dropped without an answer
    Abandoned,
}

impl ApprovalOutcome {
    /// The response payload, or an empty approval
    pub fn into_payload(self) -> Value {
        match self {
            ApprovalOutcome::Responded(payload) => payload,
            _ => Value::Null,
        }
    }
}

struct PendingApproval {
    ticket: u64,
    response_topic: String,
    responder: Option<oneshot::Sender<Value>>,
}

type PendingMap = Mutex<HashMap<String, PendingApproval>>;

/// Removes the pending entry on drop if it still belongs to this request
struct Registration {
    pending: Arc<PendingMap>,
    session: String,
    ticket: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending
            .get(&self.session)
            .is_some_and(|entry| entry.ticket == self.ticket)
        {
            pending.remove(&self.session);
        }
    }
}

/// Correlates outbound approval requests with inbound responses
pub struct ApprovalBroker {
    sink: Arc<dyn EventSink>,
    pending: Arc<PendingMap>,
    next_ticket: AtomicU64,
}

impl ApprovalBroker {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingApproval>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish a request and wait for the correlated response
    ///
    /// Fails fast with `AlreadyPending` if the session already waits on an
    /// approval. A timeout is an outcome, not an error.
    #[tracing::instrument(skip(self, payload))]
    pub async fn request_approval(
        &self,
        session: &str,
        kind: ApprovalKind,
        payload: Value,
        timeout: Duration,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = self.lock();
            if pending.contains_key(session) {
                return Err(ApprovalError::AlreadyPending {
                    session: session.to_string(),
                });
            }
            pending.insert(
                session.to_string(),
                PendingApproval {
                    ticket,
                    response_topic: session_topic(session, kind.response_suffix()),
                    responder: Some(tx),
                },
            );
        }
        let _registration = Registration {
            pending: self.pending.clone(),
            session: session.to_string(),
            ticket,
        };

        self.sink
            .publish(&session_topic(session, kind.request_suffix()), payload)
            .await?;
        tracing::info!("Waiting for approval");

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => ApprovalOutcome::Responded(response),
            Ok(Err(_)) => ApprovalOutcome::Abandoned,
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "Approval timed out");
                ApprovalOutcome::TimedOut
            }
        };
        Ok(outcome)
    }

    /// Route an inbound message to the waiter registered for its topic
    ///
    /// Returns whether a waiter was resolved. Messages for unknown sessions,
    /// mismatched topics and repeated deliveries are ignored.
    pub fn deliver(&self, topic: &str, payload: Value) -> bool {
        let Some((session, _)) = split_topic(topic) else {
            return false;
        };

        let responder = {
            let mut pending = self.lock();
            match pending.get_mut(session) {
                Some(entry) if entry.response_topic == topic => entry.responder.take(),
                _ => None,
            }
        };

        match responder {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                tracing::debug!(topic, "No pending approval for response");
                false
            }
        }
    }

    pub fn is_pending(&self, session: &str) -> bool {
        self.lock().contains_key(session)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
