//! # Worklet Models
//!
//! Centralized model endpoint configuration for the Worklet pipeline.
//!
//! A model is always addressed together with the endpoint serving it: the
//! same model loaded on two inference servers is two independent resources,
//! each with its own throttle gate.
//!
//! ## Example
//! ```rust,ignore
//! use worklet_core::models::ModelConfig;
//!
//! let primary = ModelConfig::new("gpt-oss:20b", 11435);
//! let secondary = ModelConfig::new("gpt-oss:20b", 11434).with_host("gpu-2");
//! assert_ne!(primary.resource_key(), secondary.resource_key());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Model served by default on every endpoint
pub const DEFAULT_MODEL: &str = "gpt-oss:20b-50k-8k";

/// Host of the local inference servers
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port of the first inference server
pub const PRIMARY_PORT: u16 = 11435;

/// Port of the second inference server
pub const SECONDARY_PORT: u16 = 11434;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

/// Configuration for one model on one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name as the endpoint knows it (e.g., "gpt-oss:20b")
    pub model: String,
    /// Host of the inference server
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of the inference server
    pub port: u16,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL, PRIMARY_PORT)
    }
}

impl ModelConfig {
    /// Create a config for a model on the default host
    pub fn new(model: impl Into<String>, port: u16) -> Self {
        Self {
            model: model.into(),
            host: default_host(),
            port,
        }
    }

    /// Set the host serving the model
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Base URL of the endpoint
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// The throttled resource this config addresses
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey(format!("{}@{}:{}", self.model, self.host, self.port))
    }
}

/// Identifier of a throttled external dependency (model + endpoint)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
