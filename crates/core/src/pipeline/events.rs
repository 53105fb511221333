//! # Pipeline Events
//!
//! Progress events a caller can observe while a workflow runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::PipelineStage;

/// Kind of pipeline event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// Workflow started
    PipelineStarted,
    /// Stage started
    StageStarted,
    /// Stage completed
    StageCompleted,
    /// Stage skipped by a skip rule
    StageSkipped,
    /// Workflow completed
    PipelineCompleted,
    /// Workflow aborted by a stage error
    PipelineFailed,
}

/// An event in a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    pub session: String,
    /// Stage the event concerns, if any
    #[serde(default)]
    pub stage: Option<PipelineStage>,
    /// Associated data (JSON)
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    /// Create a new event
    pub fn new(kind: PipelineEventKind, session: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            session: session.to_string(),
            stage: None,
            data: None,
        }
    }

    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Add data to the event
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = PipelineEvent::new(PipelineEventKind::StageSkipped, "s-1")
            .with_stage(PipelineStage::WebSearch)
            .with_data(serde_json::json!({"reason": "no_approved_queries"}));

        assert_eq!(event.session, "s-1");
        assert_eq!(event.stage, Some(PipelineStage::WebSearch));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "stage_skipped");
        assert_eq!(value["stage"], "web_search");
    }
}
