//! # Resilient Invoker
//!
//! Wraps one structured model call:
//!
//! ```text
//! acquire permit(model@host:port)
//!   ├── attempt 1: transport ──▶ decode ──▶ ok? return
//!   ├── attempt 2: ...
//!   └── attempt N: fail ──▶ ExhaustedRetries { last }
//! release permit (drop, on every exit path)
//! ```
//!
//! The permit is held across all attempts, so a retrying call keeps its
//! place at the endpoint instead of re-queuing behind other callers.

use std::sync::Arc;

use super::retry::{RetryPolicy, MODEL_ATTEMPTS};
use super::schema::StructuredOutput;
use super::throttle::ThrottleRegistry;
use super::transport::{ModelTransport, Prompt};
use crate::error::{AttemptError, InvokeError};
use crate::models::ModelConfig;

pub struct ResilientInvoker {
    transport: Arc<dyn ModelTransport>,
    throttles: Arc<ThrottleRegistry>,
    max_attempts: u32,
}

impl ResilientInvoker {
    pub fn new(transport: Arc<dyn ModelTransport>, throttles: Arc<ThrottleRegistry>) -> Self {
        Self {
            transport,
            throttles,
            max_attempts: MODEL_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn throttles(&self) -> &Arc<ThrottleRegistry> {
        &self.throttles
    }

    /// Invoke with the configured attempt limit
    pub async fn invoke<T: StructuredOutput>(
        &self,
        model: &ModelConfig,
        prompt: &Prompt,
    ) -> Result<T, InvokeError> {
        self.invoke_with_attempts(model, prompt, self.max_attempts)
            .await
    }

    #[tracing::instrument(skip(self, prompt), fields(resource = %model.resource_key(), output = T::output_name()))]
    pub async fn invoke_with_attempts<T: StructuredOutput>(
        &self,
        model: &ModelConfig,
        prompt: &Prompt,
        max_attempts: u32,
    ) -> Result<T, InvokeError> {
        let key = model.resource_key();
        let _permit = self.throttles.acquire(&key).await?;

        let policy = RetryPolicy::model_calls(max_attempts);
        let schema = T::response_schema();
        let transport = &self.transport;
        let schema = &schema;

        let mut attempts = 0;
        let result = policy
            .run(key.as_str(), |attempt| {
                attempts = attempt;
                async move {
                    let payload = transport.invoke(model, schema, prompt).await?;
                    T::decode(payload).map_err(AttemptError::from)
                }
            })
            .await;

        match result {
            Ok(value) => {
                tracing::debug!(attempts, "model call succeeded");
                Ok(value)
            }
            Err(last) => Err(InvokeError::ExhaustedRetries {
                resource: key.to_string(),
                attempts,
                last,
            }),
        }
    }
}
