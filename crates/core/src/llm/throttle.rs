//! # Resource Throttle
//!
//! One counting gate per resource key, created lazily on first use and kept
//! for the lifetime of the registry. With the default permit count of one,
//! calls to the same model endpoint are strictly serialized while calls to
//! different endpoints proceed independently.
//!
//! `close` shuts every gate: waiters and later callers fail with
//! `ThrottleClosed` instead of queuing behind calls that will never finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::InvokeError;
use crate::models::ResourceKey;

/// Permits per resource unless configured otherwise
pub const DEFAULT_PERMITS: usize = 1;

/// Scoped permit; released on drop, including on cancellation
#[derive(Debug)]
pub struct ThrottlePermit {
    key: ResourceKey,
    _permit: OwnedSemaphorePermit,
}

impl ThrottlePermit {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
}

#[derive(Debug, Default)]
struct Gates {
    by_key: HashMap<ResourceKey, Arc<Semaphore>>,
    closed: bool,
}

/// Process-scoped map from resource key to its gate
#[derive(Debug)]
pub struct ThrottleRegistry {
    gates: Mutex<Gates>,
    permits: usize,
}

impl Default for ThrottleRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PERMITS)
    }
}

impl ThrottleRegistry {
    pub fn new(permits: usize) -> Self {
        Self {
            gates: Mutex::new(Gates::default()),
            permits: permits.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Gates> {
        // Gates are only inserted or closed, so a poisoned lock is still consistent
        self.gates.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the gate for a key, creating it if this is the first use
    fn gate(&self, key: &ResourceKey) -> Option<Arc<Semaphore>> {
        let mut gates = self.lock();
        if gates.closed {
            return None;
        }
        let gate = gates
            .by_key
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits)))
            .clone();
        Some(gate)
    }

    /// Wait for a permit on `key`
    pub async fn acquire(&self, key: &ResourceKey) -> Result<ThrottlePermit, InvokeError> {
        let closed = || InvokeError::ThrottleClosed {
            resource: key.to_string(),
        };
        let gate = self.gate(key).ok_or_else(closed)?;
        let permit = gate.acquire_owned().await.map_err(|_| closed())?;

        Ok(ThrottlePermit {
            key: key.clone(),
            _permit: permit,
        })
    }

    /// Close every gate; held permits stay valid until dropped
    pub fn close(&self) {
        let mut gates = self.lock();
        gates.closed = true;
        for gate in gates.by_key.values() {
            gate.close();
        }
        tracing::info!(gates = gates.by_key.len(), "Throttle gates closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of gates created so far
    pub fn gate_count(&self) -> usize {
        self.lock().by_key.len()
    }

    /// Free permits on `key`, or the full count if the gate does not exist yet
    pub fn available(&self, key: &ResourceKey) -> usize {
        self.lock()
            .by_key
            .get(key)
            .map(|gate| gate.available_permits())
            .unwrap_or(self.permits)
    }
}
