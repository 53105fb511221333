//! Process-scoped services shared by every workflow run.

use std::sync::Arc;

use crate::approval::ApprovalBroker;
use crate::budget::ContextBudgeter;
use crate::config::PipelineConfig;
use crate::llm::{ModelTransport, ResilientInvoker, ThrottleRegistry, Tokenizer};
use crate::pubsub::EventSink;
use crate::status::StatusBroadcaster;
use crate::tools::{ArtifactSink, LinkExtractor, ReferenceFinder, WebSearch};

/// Services a stage can reach
///
/// Built once per process and shared by `Arc`; the throttle registry,
/// approval broker and status broadcaster inside it are process-wide.
/// Optional collaborators that are missing make their stage a no-op.
pub struct StageContext {
    pub config: PipelineConfig,
    pub invoker: Arc<ResilientInvoker>,
    pub budgeter: ContextBudgeter,
    pub approvals: Arc<ApprovalBroker>,
    pub status: Arc<StatusBroadcaster>,
    pub links: Option<Arc<dyn LinkExtractor>>,
    pub search: Option<Arc<dyn WebSearch>>,
    pub references: Arc<ReferenceFinder>,
    pub artifacts: Option<Arc<dyn ArtifactSink>>,
}

impl StageContext {
    pub fn new(
        config: PipelineConfig,
        transport: Arc<dyn ModelTransport>,
        tokenizer: Arc<dyn Tokenizer>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let invoker = ResilientInvoker::new(transport, Arc::new(ThrottleRegistry::default()))
            .with_max_attempts(config.max_attempts);
        let status = StatusBroadcaster::with_interval(sink.clone(), config.status_interval());

        Self {
            invoker: Arc::new(invoker),
            budgeter: ContextBudgeter::new(tokenizer),
            approvals: Arc::new(ApprovalBroker::new(sink)),
            status: Arc::new(status),
            links: None,
            search: None,
            references: Arc::new(ReferenceFinder::new()),
            artifacts: None,
            config,
        }
    }

    pub fn with_links(mut self, links: Arc<dyn LinkExtractor>) -> Self {
        self.links = Some(links);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_references(mut self, references: ReferenceFinder) -> Self {
        self.references = Arc::new(references);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactSink>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}
