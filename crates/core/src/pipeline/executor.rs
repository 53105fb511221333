//! # Stage Graph Executor
//!
//! Runs the stages of one workflow in order over a single state.
//!
//! ```text
//! ProcessInput → ExtractKeywordsDomains → PlanWebSearch → WebSearch?
//!   → GenerateWorklets → AttachReferences → RankReferences? → EmitFiles
//! ```
//!
//! `WebSearch` is skipped when no query was approved, `RankReferences` when
//! ranking is switched off. The first stage error ends the run: a failure
//! status is published and the error is returned.
//!
//! Events are best-effort: a full observer channel drops the event and a
//! closed one is detached, so a slow observer never holds up a stage.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::context::StageContext;
use super::events::{PipelineEvent, PipelineEventKind};
use super::stage::{Pipeline, PipelineStage};
use super::stages::{self, announce};
use super::state::PipelineState;
use crate::pubsub::{session_topic, STATUS_UPDATE};

pub struct PipelineExecutor {
    ctx: Arc<StageContext>,
    event_tx: Mutex<Option<mpsc::Sender<PipelineEvent>>>,
}

impl PipelineExecutor {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self {
            ctx,
            event_tx: Mutex::new(None),
        }
    }

    /// Stream pipeline events to `tx`
    pub fn with_event_channel(self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        *self.event_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        self
    }

    pub fn context(&self) -> &Arc<StageContext> {
        &self.ctx
    }

    fn emit(&self, event: PipelineEvent) {
        let mut event_tx = self.event_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = event_tx.as_ref() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(kind = ?event.kind, "Event channel full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Event receiver dropped, detaching");
                *event_tx = None;
            }
        }
    }

    /// Run every stage over `state` and return the finished state
    #[tracing::instrument(skip_all, fields(session = %state.session_key))]
    pub async fn run(&self, state: PipelineState) -> Result<PipelineState> {
        let session = state.session_key.clone();
        let started = Instant::now();
        let mut pipeline = Pipeline::new(self.ctx.config.switches.rank_references);
        let mut state = state;

        announce(&self.ctx, &state, "Initializing pipeline...").await;
        self.emit(PipelineEvent::new(PipelineEventKind::PipelineStarted, &session));

        while !pipeline.is_complete() {
            let stage = pipeline.stage;

            if let Some(reason) = pipeline.skip_reason(&state) {
                tracing::info!(stage = stage.name(), ?reason, "Stage skipped");
                if stage == PipelineStage::WebSearch {
                    state.clear_web_search();
                }
                self.emit(
                    PipelineEvent::new(PipelineEventKind::StageSkipped, &session)
                        .with_stage(stage)
                        .with_data(json!({ "reason": reason })),
                );
                pipeline.advance();
                continue;
            }

            self.emit(PipelineEvent::new(PipelineEventKind::StageStarted, &session).with_stage(stage));
            let stage_started = Instant::now();

            match self.run_stage(stage, state).await {
                Ok(next) => {
                    state = next;
                    let elapsed_ms = stage_started.elapsed().as_millis() as u64;
                    tracing::info!(stage = stage.name(), elapsed_ms, "Stage completed");
                    self.emit(
                        PipelineEvent::new(PipelineEventKind::StageCompleted, &session)
                            .with_stage(stage)
                            .with_data(json!({ "elapsed_ms": elapsed_ms })),
                    );
                    pipeline.advance();
                }
                Err(e) => {
                    pipeline.fail();
                    tracing::error!(stage = stage.name(), "Stage failed: {:#}", e);

                    let topic = session_topic(&session, STATUS_UPDATE);
                    self.ctx
                        .status
                        .set_message(format!("Worklet generation failed: {}", e), Some(topic))
                        .await;
                    self.ctx.status.stop().await;

                    self.emit(
                        PipelineEvent::new(PipelineEventKind::PipelineFailed, &session)
                            .with_stage(stage)
                            .with_data(json!({ "error": format!("{:#}", e) })),
                    );
                    return Err(e.context(format!("Stage {} failed", stage.name())));
                }
            }
        }

        announce(&self.ctx, &state, "Worklet generation completed.").await;
        self.ctx.status.stop().await;

        tracing::info!(
            worklets = state.worklets.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline completed"
        );
        self.emit(
            PipelineEvent::new(PipelineEventKind::PipelineCompleted, &session)
                .with_data(json!({ "worklets": state.worklets.len() })),
        );
        Ok(state)
    }

    async fn run_stage(&self, stage: PipelineStage, state: PipelineState) -> Result<PipelineState> {
        let ctx = self.ctx.as_ref();
        match stage {
            PipelineStage::ProcessInput => stages::process_input(ctx, state).await,
            PipelineStage::ExtractKeywordsDomains => stages::extract_keywords_domains(ctx, state).await,
            PipelineStage::PlanWebSearch => stages::plan_web_search(ctx, state).await,
            PipelineStage::WebSearch => stages::web_search(ctx, state).await,
            PipelineStage::GenerateWorklets => stages::generate_worklets(ctx, state).await,
            PipelineStage::AttachReferences => stages::attach_references(ctx, state).await,
            PipelineStage::RankReferences => stages::rank_references(ctx, state).await,
            PipelineStage::EmitFiles => stages::emit_files(ctx, state).await,
            PipelineStage::Complete | PipelineStage::Failed => Ok(state),
        }
    }
}
