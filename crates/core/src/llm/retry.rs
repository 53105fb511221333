//! Bounded retry loop.
//!
//! Two policies are in use: model calls retry immediately (every attempt is
//! already serialized behind the throttle), upstream search and extraction
//! calls wait a short fixed delay between attempts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempts allowed per model call
pub const MODEL_ATTEMPTS: u32 = 10;

/// Attempts allowed per upstream search/extract call
pub const UPSTREAM_ATTEMPTS: u32 = 5;

/// Delay between upstream attempts
pub const UPSTREAM_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Immediate retries for model calls
    pub fn model_calls(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Fixed-delay retries for search and extraction
    pub fn upstream() -> Self {
        Self::new(UPSTREAM_ATTEMPTS, UPSTREAM_DELAY)
    }

    /// Run `op` until it succeeds or attempts run out, returning the last error
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => {
                    tracing::warn!(label, attempt, "giving up: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(label, attempt, "attempt failed: {}", e);
                }
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::model_calls(MODEL_ATTEMPTS)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(delay.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
