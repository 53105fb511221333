//! # Pipeline
//!
//! The worklet workflow: state, stage order, stage functions and the
//! executor that drives them. `iterate` revises finished worklets.

pub mod context;
pub mod events;
pub mod executor;
pub mod iterate;
pub mod prompts;
pub mod stage;
pub mod stages;
pub mod state;

pub use context::StageContext;
pub use events::{PipelineEvent, PipelineEventKind};
pub use executor::PipelineExecutor;
pub use iterate::{enhance_worklet, iterate_field, FieldShape, FieldValue, WorkletField, WorkletVersions};
pub use stage::{Pipeline, PipelineStage, SkipReason};
pub use state::{InputDocument, KeywordsDomains, PipelineState, Worklet};
