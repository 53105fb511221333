//! Error types for Worklet Core
//!
//! Component-level failures are typed so call sites can decide their
//! fallback:
//! - Transport and schema failures are retried by the invoker
//! - Exhausted retries are terminal for one call site
//! - Approval failures cover registration and publishing only; a timeout is
//!   an outcome, not an error
//!
//! Stage functions wrap these in `anyhow::Error` with context.

use thiserror::Error;

/// Failure talking to a model endpoint
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network failure, connection refused, request timeout
    #[error("request failed: {0}")]
    Request(String),

    /// Endpoint answered with a non-2xx status
    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Endpoint answered 2xx but the body could not be parsed
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// A payload that does not have the expected shape
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: expected {expected}, found {found}")]
pub struct SchemaError {
    /// JSON path of the offending value (`$.keywords.link[2]`)
    pub path: String,
    pub expected: String,
    pub found: String,
}

impl SchemaError {
    pub fn new(
        path: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// Why a single invocation attempt was rejected
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("schema mismatch: {0}")]
    Schema(#[from] SchemaError),
}

/// Terminal failure of a resilient invocation
#[derive(Debug, Error)]
pub enum InvokeError {
    /// No attempt produced a schema-valid result
    #[error("{resource}: no valid response after {attempts} attempts: {last}")]
    ExhaustedRetries {
        resource: String,
        attempts: u32,
        #[source]
        last: AttemptError,
    },

    /// The throttle registry was closed for shutdown
    #[error("{resource}: throttle gate closed")]
    ThrottleClosed { resource: String },
}

/// Failure publishing on the outbound event channel
#[derive(Debug, Clone, Error)]
#[error("failed to publish to {topic}: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub reason: String,
}

/// Failure of the approval gate itself
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// A second request for a session that already waits on an approval
    #[error("approval already pending for session {session}")]
    AlreadyPending { session: String },

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Invalid budget configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error("max_tokens ({max_tokens}) must be greater than reserved overhead ({reserved})")]
    NoRoom { max_tokens: usize, reserved: usize },
}

/// A worklet revision request that cannot be carried out
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IterateError {
    #[error("revision instruction is empty")]
    EmptyInstruction,

    #[error("worklet version {version} not found")]
    UnknownVersion { version: uuid::Uuid },
}

/// Failure writing generated artifacts
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
