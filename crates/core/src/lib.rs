//! # Worklet Core
//!
//! The control plane of the Worklet pipeline: it sequences and protects
//! calls to slow, rate-limited and unreliable collaborators (model endpoints,
//! search APIs, a human approver).
//!
//! ## Architecture
//!
//! - `llm/` - Model transport, per-endpoint throttle, resilient invoker, typed outputs
//! - `budget/` - Context budgeter (token-bounded trimming of prompt material)
//! - `approval/` - Approval broker correlating requests with human responses
//! - `status` - Status broadcaster republishing the latest progress message
//! - `pubsub` - Topic naming, outbound sink trait, in-process topic hub
//! - `pipeline/` - Pipeline state, stages, the stage graph executor and worklet iteration
//! - `tools/` - Search, reference and artifact collaborators with default adapters
//! - `config` - Pipeline configuration
//! - `models` - Model endpoint configuration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use worklet_core::config::PipelineConfig;
//! use worklet_core::llm::{Cl100kTokenizer, OllamaTransport};
//! use worklet_core::pipeline::{PipelineExecutor, PipelineState, StageContext};
//! use worklet_core::pubsub::TopicHub;
//!
//! let hub = TopicHub::default();
//! let ctx = StageContext::new(
//!     PipelineConfig::from_env()?,
//!     Arc::new(OllamaTransport::new(Duration::from_secs(600))?),
//!     Arc::new(Cl100kTokenizer::new()?),
//!     Arc::new(hub.clone()),
//! );
//! let executor = PipelineExecutor::new(Arc::new(ctx));
//! let state = executor
//!     .run(PipelineState::new("thread-1", 3).with_custom_prompt("on-device OCR"))
//!     .await?;
//! ```

pub mod approval;
pub mod budget;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod pubsub;
pub mod status;
pub mod tools;
