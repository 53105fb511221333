//! # Worklet Iteration
//!
//! Revises a finished worklet on request, either one field at a time or as
//! a whole. Each revision becomes a new version of the worklet and is
//! selected; earlier versions are kept and can be selected again.
//!
//! ```text
//! version 0 (generated) ──iterate_field(kpis)──▶ version 1 ──enhance──▶ version 2
//!                                                   ▲
//!                                       select(version 1)
//! ```
//!
//! Field revisions are checked against the field's shape (text, list or
//! map); a reply of the wrong shape is retried like any other invalid model
//! output.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::context::StageContext;
use super::prompts;
use super::state::Worklet;
use crate::error::{IterateError, SchemaError};
use crate::llm::outputs::{
    ArrayFieldResponse, GeneratedWorklet, ObjectFieldResponse, StringFieldResponse,
};
use crate::tools::Reference;

/// Shape a field's value must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    Text,
    List,
    Map,
}

impl FieldShape {
    pub fn name(&self) -> &'static str {
        match self {
            FieldShape::Text => "string",
            FieldShape::List => "list",
            FieldShape::Map => "map",
        }
    }

    /// What the model is asked to return
    pub fn describe(&self) -> &'static str {
        match self {
            FieldShape::Text => "a concise, high-quality string",
            FieldShape::List => "an ordered list of meaningful bullet points as strings",
            FieldShape::Map => "a JSON object keyed by timeframe with string descriptions",
        }
    }
}

/// A worklet field that can be revised on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkletField {
    Title,
    ProblemStatement,
    Description,
    ChallengeUseCase,
    Deliverables,
    Kpis,
    Prerequisites,
    InfrastructureRequirements,
    TechStack,
    Milestones,
}

impl WorkletField {
    pub const ALL: [WorkletField; 10] = [
        WorkletField::Title,
        WorkletField::ProblemStatement,
        WorkletField::Description,
        WorkletField::ChallengeUseCase,
        WorkletField::Deliverables,
        WorkletField::Kpis,
        WorkletField::Prerequisites,
        WorkletField::InfrastructureRequirements,
        WorkletField::TechStack,
        WorkletField::Milestones,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WorkletField::Title => "title",
            WorkletField::ProblemStatement => "problem_statement",
            WorkletField::Description => "description",
            WorkletField::ChallengeUseCase => "challenge_use_case",
            WorkletField::Deliverables => "deliverables",
            WorkletField::Kpis => "kpis",
            WorkletField::Prerequisites => "prerequisites",
            WorkletField::InfrastructureRequirements => "infrastructure_requirements",
            WorkletField::TechStack => "tech_stack",
            WorkletField::Milestones => "milestones",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.name() == name)
    }

    pub fn shape(&self) -> FieldShape {
        match self {
            WorkletField::Deliverables | WorkletField::Kpis | WorkletField::Prerequisites => {
                FieldShape::List
            }
            WorkletField::Milestones => FieldShape::Map,
            _ => FieldShape::Text,
        }
    }

    fn text_mut<'a>(&self, worklet: &'a mut GeneratedWorklet) -> Option<&'a mut String> {
        match self {
            WorkletField::Title => Some(&mut worklet.title),
            WorkletField::ProblemStatement => Some(&mut worklet.problem_statement),
            WorkletField::Description => Some(&mut worklet.description),
            WorkletField::ChallengeUseCase => Some(&mut worklet.challenge_use_case),
            WorkletField::InfrastructureRequirements => {
                Some(&mut worklet.infrastructure_requirements)
            }
            WorkletField::TechStack => Some(&mut worklet.tech_stack),
            _ => None,
        }
    }

    fn list_mut<'a>(&self, worklet: &'a mut GeneratedWorklet) -> Option<&'a mut Vec<String>> {
        match self {
            WorkletField::Deliverables => Some(&mut worklet.deliverables),
            WorkletField::Kpis => Some(&mut worklet.kpis),
            WorkletField::Prerequisites => Some(&mut worklet.prerequisites),
            _ => None,
        }
    }
}

/// A revised field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
}

impl FieldValue {
    pub fn shape(&self) -> FieldShape {
        match self {
            FieldValue::Text(_) => FieldShape::Text,
            FieldValue::List(_) => FieldShape::List,
            FieldValue::Map(_) => FieldShape::Map,
        }
    }

    /// Write into `field` of `worklet`; the value must have the field's shape
    pub fn write_to(self, field: WorkletField, worklet: &mut GeneratedWorklet) -> Result<(), SchemaError> {
        let found = self.shape().name();
        let mismatch = || SchemaError::new(format!("$.{}", field.name()), field.shape().name(), found);

        match self {
            FieldValue::Text(text) => *field.text_mut(worklet).ok_or_else(mismatch)? = text,
            FieldValue::List(items) => {
                *field.list_mut(worklet).ok_or_else(mismatch)? = clean_items(&items)
            }
            FieldValue::Map(map) if field == WorkletField::Milestones => worklet.milestones = map,
            FieldValue::Map(_) => return Err(mismatch()),
        }
        Ok(())
    }
}

/// Trim list items and drop blank ones
fn clean_items(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// What produced a version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionOrigin {
    Generated,
    Field { field: WorkletField, instruction: String },
    Enhanced { instruction: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkletVersion {
    pub version_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub origin: VersionOrigin,
    pub content: GeneratedWorklet,
    #[serde(default)]
    pub references: Vec<Reference>,
}

impl WorkletVersion {
    fn new(origin: VersionOrigin, content: GeneratedWorklet, references: Vec<Reference>) -> Self {
        Self {
            version_id: Uuid::new_v4(),
            created_at: Utc::now(),
            origin,
            content,
            references,
        }
    }
}

/// Every version of one worklet plus the selected one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkletVersions {
    worklet_id: Uuid,
    selected: usize,
    versions: Vec<WorkletVersion>,
}

impl WorkletVersions {
    /// Start the history from a generated worklet
    pub fn new(worklet: &Worklet) -> Self {
        Self {
            worklet_id: worklet.worklet_id,
            selected: 0,
            versions: vec![WorkletVersion::new(
                VersionOrigin::Generated,
                worklet.content.clone(),
                worklet.references.clone(),
            )],
        }
    }

    pub fn worklet_id(&self) -> Uuid {
        self.worklet_id
    }

    pub fn versions(&self) -> &[WorkletVersion] {
        &self.versions
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected(&self) -> Option<&WorkletVersion> {
        self.versions.get(self.selected)
    }

    pub fn get(&self, version: Uuid) -> Option<&WorkletVersion> {
        self.versions.iter().find(|v| v.version_id == version)
    }

    /// Make `version` the selected one, returning its index
    pub fn select(&mut self, version: Uuid) -> Result<usize, IterateError> {
        let index = self
            .versions
            .iter()
            .position(|v| v.version_id == version)
            .ok_or(IterateError::UnknownVersion { version })?;
        self.selected = index;
        Ok(index)
    }

    /// The selected version as a worklet
    pub fn current(&self) -> Option<Worklet> {
        self.selected().map(|version| Worklet {
            worklet_id: self.worklet_id,
            content: version.content.clone(),
            references: version.references.clone(),
        })
    }

    fn base(&self, version: Uuid) -> Result<&WorkletVersion, IterateError> {
        self.get(version)
            .ok_or(IterateError::UnknownVersion { version })
    }

    fn push(&mut self, version: WorkletVersion) -> Uuid {
        let id = version.version_id;
        self.versions.push(version);
        self.selected = self.versions.len() - 1;
        id
    }
}

fn instruction(text: &str) -> Result<&str, IterateError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(IterateError::EmptyInstruction);
    }
    Ok(text)
}

/// Revise one field of version `base` and select the result
///
/// Returns the id of the new version. On failure the history is unchanged.
#[tracing::instrument(skip_all, fields(worklet = %versions.worklet_id(), field = field.name()))]
pub async fn iterate_field(
    ctx: &StageContext,
    versions: &mut WorkletVersions,
    base: Uuid,
    field: WorkletField,
    request: &str,
) -> Result<Uuid> {
    let request = instruction(request)?;
    let base = versions.base(base)?;
    let shape = field.shape();
    let prompt = prompts::field_iteration(&base.content, field.name(), shape.describe(), request)
        .context("Building the field prompt failed")?;
    let model = &ctx.config.models.generation;

    let value = match shape {
        FieldShape::Text => {
            let response: StringFieldResponse = ctx.invoker.invoke(model, &prompt).await?;
            FieldValue::Text(response.updated_value)
        }
        FieldShape::List => {
            let response: ArrayFieldResponse = ctx.invoker.invoke(model, &prompt).await?;
            FieldValue::List(response.updated_value)
        }
        FieldShape::Map => {
            let response: ObjectFieldResponse = ctx.invoker.invoke(model, &prompt).await?;
            FieldValue::Map(response.updated_value)
        }
    };

    let mut content = base.content.clone();
    value.write_to(field, &mut content)?;
    content.normalize_text();

    let version = WorkletVersion::new(
        VersionOrigin::Field {
            field,
            instruction: request.to_string(),
        },
        content,
        base.references.clone(),
    );
    let id = versions.push(version);
    tracing::info!(version = %id, "Field revised");
    Ok(id)
}

/// Rewrite the whole of version `base` and select the result
///
/// References carry over from the base version unchanged.
#[tracing::instrument(skip_all, fields(worklet = %versions.worklet_id()))]
pub async fn enhance_worklet(
    ctx: &StageContext,
    versions: &mut WorkletVersions,
    base: Uuid,
    request: &str,
) -> Result<Uuid> {
    let request = instruction(request)?;
    let base = versions.base(base)?;
    let prompt = prompts::worklet_enhancement(&base.content, request)
        .context("Building the enhancement prompt failed")?;

    let mut content: GeneratedWorklet = ctx
        .invoker
        .invoke(&ctx.config.models.generation, &prompt)
        .await
        .context("Worklet enhancement failed")?;
    content.normalize_text();

    let version = WorkletVersion::new(
        VersionOrigin::Enhanced {
            instruction: request.to_string(),
        },
        content,
        base.references.clone(),
    );
    let id = versions.push(version);
    tracing::info!(version = %id, "Worklet enhanced");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::{InvokeError, TransportError};
    use crate::llm::{ModelTransport, Prompt, WhitespaceTokenizer};
    use crate::models::ModelConfig;
    use crate::pubsub::TopicHub;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays scripted payloads and records the requested formats
    #[derive(Default)]
    struct Replies {
        queue: Mutex<VecDeque<Value>>,
        formats: Mutex<Vec<Value>>,
    }

    impl Replies {
        fn new(replies: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                queue: Mutex::new(replies.into()),
                formats: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.formats.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelTransport for Replies {
        async fn invoke(
            &self,
            _model: &ModelConfig,
            format: &Value,
            _prompt: &Prompt,
        ) -> Result<Value, TransportError> {
            self.formats.lock().unwrap().push(format.clone());
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Request("no reply scripted".into()))
        }
    }

    fn context(transport: Arc<Replies>, max_attempts: u32) -> StageContext {
        let mut config = PipelineConfig::default();
        config.max_attempts = max_attempts;
        StageContext::new(
            config,
            transport,
            Arc::new(WhitespaceTokenizer),
            Arc::new(TopicHub::default()),
        )
    }

    fn generated() -> WorkletVersions {
        let worklet = Worklet::new(
            GeneratedWorklet {
                title: "Edge OCR".into(),
                deliverables: vec!["app".into()],
                kpis: vec!["latency".into()],
                milestones: BTreeMap::from([("month_1".to_string(), json!("prototype"))]),
                ..Default::default()
            },
            vec![Reference {
                title: "paper".into(),
                tag: "scholar".into(),
                ..Default::default()
            }],
        );
        WorkletVersions::new(&worklet)
    }

    fn base_id(versions: &WorkletVersions) -> Uuid {
        versions.versions()[0].version_id
    }

    #[tokio::test]
    async fn test_text_field_becomes_selected_version() {
        let transport = Replies::new(vec![json!({"updated_value": "Edge\u{2011}OCR Lite"})]);
        let ctx = context(transport.clone(), 10);
        let mut versions = generated();
        let base = base_id(&versions);

        let id = iterate_field(&ctx, &mut versions, base, WorkletField::Title, " shorter ")
            .await
            .unwrap();

        assert_eq!(versions.versions().len(), 2);
        assert_eq!(versions.selected_index(), 1);
        let current = versions.current().unwrap();
        assert_eq!(current.title(), "Edge-OCR Lite");
        assert_eq!(current.worklet_id, versions.worklet_id());
        assert_eq!(current.references.len(), 1);
        assert_eq!(current.content.kpis, vec!["latency"]);
        assert_eq!(versions.get(base).unwrap().content.title, "Edge OCR");
        assert_eq!(
            versions.get(id).unwrap().origin,
            VersionOrigin::Field {
                field: WorkletField::Title,
                instruction: "shorter".into()
            }
        );
        assert_eq!(transport.formats.lock().unwrap()[0]["properties"]["updated_value"]["type"], "string");
    }

    #[tokio::test]
    async fn test_list_field_items_are_cleaned() {
        let transport = Replies::new(vec![json!({"updated_value": [" p95 latency ", "", "accuracy"]})]);
        let ctx = context(transport.clone(), 10);
        let mut versions = generated();
        let base = base_id(&versions);

        iterate_field(&ctx, &mut versions, base, WorkletField::Kpis, "make them measurable")
            .await
            .unwrap();

        let current = versions.current().unwrap();
        assert_eq!(current.content.kpis, vec!["p95 latency", "accuracy"]);
        assert_eq!(current.content.deliverables, vec!["app"]);
        assert_eq!(transport.formats.lock().unwrap()[0]["properties"]["updated_value"]["type"], "array");
    }

    #[tokio::test]
    async fn test_map_field_replaces_milestones() {
        let transport = Replies::new(vec![json!({
            "updated_value": {"month_1": "scope", "month_2": "pilot"}
        })]);
        let ctx = context(transport, 10);
        let mut versions = generated();
        let base = base_id(&versions);

        iterate_field(&ctx, &mut versions, base, WorkletField::Milestones, "split into two")
            .await
            .unwrap();

        let milestones = versions.current().unwrap().content.milestones;
        assert_eq!(milestones.len(), 2);
        assert_eq!(milestones["month_2"], "pilot");
    }

    #[tokio::test]
    async fn test_wrong_shape_is_retried() {
        let transport = Replies::new(vec![
            json!({"updated_value": ["Edge OCR"]}),
            json!({"updated_value": {"title": "Edge OCR"}}),
            json!({"updated_value": "Pocket OCR"}),
        ]);
        let ctx = context(transport.clone(), 10);
        let mut versions = generated();
        let base = base_id(&versions);

        iterate_field(&ctx, &mut versions, base, WorkletField::Title, "rename")
            .await
            .unwrap();

        assert_eq!(transport.calls(), 3);
        assert_eq!(versions.current().unwrap().title(), "Pocket OCR");
    }

    #[tokio::test]
    async fn test_exhausted_attempts_leave_history_unchanged() {
        let transport = Replies::new(vec![
            json!({"updated_value": "a; b"}),
            json!({"updated_value": "c"}),
        ]);
        let ctx = context(transport.clone(), 2);
        let mut versions = generated();
        let base = base_id(&versions);

        let err = iterate_field(&ctx, &mut versions, base, WorkletField::Deliverables, "more")
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<InvokeError>(),
            Some(InvokeError::ExhaustedRetries { attempts: 2, .. })
        ));
        assert_eq!(transport.calls(), 2);
        assert_eq!(versions.versions().len(), 1);
        assert_eq!(versions.selected_index(), 0);
    }

    #[tokio::test]
    async fn test_rejected_requests_skip_the_model() {
        let transport = Replies::new(Vec::new());
        let ctx = context(transport.clone(), 10);
        let mut versions = generated();
        let base = base_id(&versions);

        let empty = iterate_field(&ctx, &mut versions, base, WorkletField::Title, "   ")
            .await
            .unwrap_err();
        assert_eq!(empty.downcast_ref::<IterateError>(), Some(&IterateError::EmptyInstruction));

        let missing = Uuid::new_v4();
        let unknown = enhance_worklet(&ctx, &mut versions, missing, "tighten")
            .await
            .unwrap_err();
        assert_eq!(
            unknown.downcast_ref::<IterateError>(),
            Some(&IterateError::UnknownVersion { version: missing })
        );
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_enhancement_keeps_references_and_can_be_unselected() {
        let enhanced = GeneratedWorklet {
            title: "Edge OCR for receipts".into(),
            description: "narrow\u{202f}scope".into(),
            ..Default::default()
        };
        let transport = Replies::new(vec![serde_json::to_value(&enhanced).unwrap()]);
        let ctx = context(transport, 10);
        let mut versions = generated();
        let base = base_id(&versions);

        enhance_worklet(&ctx, &mut versions, base, "focus on receipts")
            .await
            .unwrap();

        let current = versions.current().unwrap();
        assert_eq!(current.title(), "Edge OCR for receipts");
        assert_eq!(current.content.description, "narrow scope");
        assert_eq!(current.references[0].title, "paper");

        assert_eq!(versions.select(base).unwrap(), 0);
        assert_eq!(versions.current().unwrap().title(), "Edge OCR");
    }

    #[test]
    fn test_value_of_wrong_shape_is_not_written() {
        let mut worklet = GeneratedWorklet::default();
        let err = FieldValue::List(vec!["a".into()])
            .write_to(WorkletField::Title, &mut worklet)
            .unwrap_err();

        assert_eq!(err.path, "$.title");
        assert_eq!(err.expected, "string");
        assert_eq!(err.found, "list");
        assert!(FieldValue::Text("t".into())
            .write_to(WorkletField::Milestones, &mut worklet)
            .is_err());
        assert_eq!(WorkletField::from_name("tech_stack"), Some(WorkletField::TechStack));
    }
}
