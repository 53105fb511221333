//! # Pipeline Stages
//!
//! The fixed order of a worklet workflow and its two skip rules.

use serde::{Deserialize, Serialize};

use super::state::PipelineState;

/// Stage of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Extract link text
    ProcessInput,
    /// Propose keywords and domains, approved by a human
    ExtractKeywordsDomains,
    /// Propose web search queries, approved by a human
    PlanWebSearch,
    /// Run the approved queries
    WebSearch,
    /// Generate worklets from the gathered context
    GenerateWorklets,
    /// Look up references per worklet
    AttachReferences,
    /// Order each worklet's references by relevance
    RankReferences,
    /// Hand worklets to the artifact sink
    EmitFiles,
    /// Complete
    Complete,
    /// Failed
    Failed,
}

impl PipelineStage {
    /// Stages that do work, in execution order
    pub const ORDER: [PipelineStage; 8] = [
        PipelineStage::ProcessInput,
        PipelineStage::ExtractKeywordsDomains,
        PipelineStage::PlanWebSearch,
        PipelineStage::WebSearch,
        PipelineStage::GenerateWorklets,
        PipelineStage::AttachReferences,
        PipelineStage::RankReferences,
        PipelineStage::EmitFiles,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::ProcessInput => "process_input",
            PipelineStage::ExtractKeywordsDomains => "extract_keywords_domains",
            PipelineStage::PlanWebSearch => "plan_web_search",
            PipelineStage::WebSearch => "web_search",
            PipelineStage::GenerateWorklets => "generate_worklets",
            PipelineStage::AttachReferences => "attach_references",
            PipelineStage::RankReferences => "rank_references",
            PipelineStage::EmitFiles => "emit_files",
            PipelineStage::Complete => "complete",
            PipelineStage::Failed => "failed",
        }
    }
}

/// Why a stage was not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Planning produced no approved queries
    NoApprovedQueries,
    /// Reference ranking is switched off
    RankingDisabled,
}

/// The pipeline state machine
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Current stage
    pub stage: PipelineStage,
    /// Whether reference ranking runs
    pub rank_references: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            stage: PipelineStage::ProcessInput,
            rank_references: true,
        }
    }
}

impl Pipeline {
    /// Create a new pipeline
    pub fn new(rank_references: bool) -> Self {
        Self {
            rank_references,
            ..Default::default()
        }
    }

    /// Advance to the next stage
    pub fn advance(&mut self) {
        self.stage = match self.stage {
            PipelineStage::ProcessInput => PipelineStage::ExtractKeywordsDomains,
            PipelineStage::ExtractKeywordsDomains => PipelineStage::PlanWebSearch,
            PipelineStage::PlanWebSearch => PipelineStage::WebSearch,
            PipelineStage::WebSearch => PipelineStage::GenerateWorklets,
            PipelineStage::GenerateWorklets => PipelineStage::AttachReferences,
            PipelineStage::AttachReferences => PipelineStage::RankReferences,
            PipelineStage::RankReferences => PipelineStage::EmitFiles,
            PipelineStage::EmitFiles => PipelineStage::Complete,
            PipelineStage::Complete => PipelineStage::Complete,
            PipelineStage::Failed => PipelineStage::Failed,
        };
    }

    /// Whether the current stage is skipped for `state`
    pub fn skip_reason(&self, state: &PipelineState) -> Option<SkipReason> {
        match self.stage {
            PipelineStage::WebSearch if state.web_search_queries.is_empty() => {
                Some(SkipReason::NoApprovedQueries)
            }
            PipelineStage::RankReferences if !self.rank_references => {
                Some(SkipReason::RankingDisabled)
            }
            _ => None,
        }
    }

    /// Fail the pipeline
    pub fn fail(&mut self) {
        self.stage = PipelineStage::Failed;
    }

    /// Check if pipeline is complete
    pub fn is_complete(&self) -> bool {
        matches!(self.stage, PipelineStage::Complete | PipelineStage::Failed)
    }

    /// Check if pipeline succeeded
    pub fn is_success(&self) -> bool {
        self.stage == PipelineStage::Complete
    }
}
