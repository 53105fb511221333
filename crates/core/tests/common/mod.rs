#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use worklet_core::approval::ApprovalBroker;
use worklet_core::config::PipelineConfig;
use worklet_core::error::{EmitError, TransportError};
use worklet_core::llm::outputs::GeneratedWorklet;
use worklet_core::llm::{ModelTransport, Prompt, WhitespaceTokenizer};
use worklet_core::models::ModelConfig;
use worklet_core::pipeline::{StageContext, Worklet};
use worklet_core::pubsub::{split_topic, TopicEvent, TopicHub};
use worklet_core::tools::{
    ArtifactSink, LinkData, LinkExtractor, Reference, ReferenceSource, SearchHit, SearchResult,
    WebSearch,
};

/// Model fake answering by the shape of the requested output
pub struct ScriptedModel {
    pub worklets: usize,
    pub queries: Vec<String>,
    pub fail_generation: bool,
    calls: Mutex<Vec<String>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(worklets: usize, queries: &[&str]) -> Self {
        Self {
            worklets,
            queries: queries.iter().map(|q| q.to_string()).collect(),
            fail_generation: false,
            calls: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing_generation(mut self) -> Self {
        self.fail_generation = true;
        self
    }

    /// Output kinds requested so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of concurrent calls seen on any single endpoint
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, key: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(key.to_string()).or_default();
        *count += 1;
        self.max_in_flight.fetch_max(*count, Ordering::SeqCst);
    }

    fn leave(&self, key: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(key) {
            *count -= 1;
        }
    }

    fn answer(&self, kind: &str) -> Result<Value, TransportError> {
        match kind {
            "keywords" => Ok(json!({
                "keywords": {"worklet": [], "link": [], "custom_prompt": ["ocr"]},
                "domains": {"worklet": [], "link": [], "custom_prompt": ["computer vision"]}
            })),
            "web_search_queries" => Ok(json!({ "web_search_queries": self.queries })),
            "worklets" if self.fail_generation => Err(TransportError::Status {
                status: 503,
                body: "model unavailable".into(),
            }),
            "worklets" => {
                let worklets: Vec<GeneratedWorklet> = (1..=self.worklets)
                    .map(|i| GeneratedWorklet {
                        title: format!("Worklet {i}"),
                        description: format!("Description {i}"),
                        ..Default::default()
                    })
                    .collect();
                Ok(json!({ "worklets": worklets }))
            }
            "github_keyword" => Ok(json!({
                "google_scholar_keyword": "scholar phrase",
                "github_keyword": "github phrase"
            })),
            "sorted_indices" => Ok(json!({ "sorted_indices": [1, 0, 9] })),
            other => Err(TransportError::Malformed(format!("unexpected output {other}"))),
        }
    }
}

fn output_kind(format: &Value) -> String {
    let properties = format.get("properties").and_then(Value::as_object);
    for kind in [
        "keywords",
        "web_search_queries",
        "worklets",
        "github_keyword",
        "sorted_indices",
    ] {
        if properties.is_some_and(|p| p.contains_key(kind)) {
            return kind.to_string();
        }
    }
    "unknown".to_string()
}

#[async_trait]
impl ModelTransport for ScriptedModel {
    async fn invoke(
        &self,
        model: &ModelConfig,
        format: &Value,
        _prompt: &Prompt,
    ) -> Result<Value, TransportError> {
        let key = model.resource_key().to_string();
        let kind = output_kind(format);
        self.calls.lock().unwrap().push(kind.clone());

        self.enter(&key);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.leave(&key);

        self.answer(&kind)
    }
}

/// Reference provider that fails for one keyword
pub struct FlakyReferences {
    pub tag: &'static str,
    pub fail_on: String,
}

#[async_trait]
impl ReferenceSource for FlakyReferences {
    async fn lookup(&self, keyword: &str) -> anyhow::Result<Vec<Reference>> {
        if keyword == self.fail_on {
            anyhow::bail!("provider rejected '{}'", keyword);
        }
        Ok(vec![
            Reference {
                title: format!("{keyword} first"),
                link: format!("https://{}.example/1", self.tag),
                description: "first reference".into(),
                tag: self.tag.into(),
            },
            Reference {
                title: format!("{keyword} second"),
                link: format!("https://{}.example/2", self.tag),
                description: "second reference".into(),
                tag: self.tag.into(),
            },
        ])
    }
}

/// Web search that records its queries
#[derive(Default)]
pub struct RecordingSearch {
    pub queries: Mutex<Vec<String>>,
}

#[async_trait]
impl WebSearch for RecordingSearch {
    async fn search(&self, query: &str, _max_results: usize) -> Option<SearchResult> {
        self.queries.lock().unwrap().push(query.to_string());
        Some(SearchResult {
            query: query.to_string(),
            answer: Some(format!("answer for {query}")),
            results: vec![SearchHit {
                title: "hit".into(),
                url: "https://hit.example".into(),
                content: "hit content".into(),
            }],
        })
    }
}

pub struct StaticLinks;

#[async_trait]
impl LinkExtractor for StaticLinks {
    async fn extract(&self, urls: &[String]) -> Vec<LinkData> {
        urls.iter()
            .map(|url| LinkData {
                url: url.clone(),
                title: "linked page".into(),
                content: "page text".into(),
            })
            .collect()
    }
}

/// Artifact sink keeping everything in memory
#[derive(Default)]
pub struct MemorySink {
    pub stored: Mutex<Vec<Worklet>>,
    pub emitted: Mutex<Vec<String>>,
}

#[async_trait]
impl ArtifactSink for MemorySink {
    async fn store(&self, _session: &str, worklets: &[Worklet]) -> Result<(), EmitError> {
        *self.stored.lock().unwrap() = worklets.to_vec();
        Ok(())
    }

    async fn emit(&self, session: &str, worklet: &Worklet) -> Result<PathBuf, EmitError> {
        self.emitted.lock().unwrap().push(worklet.title().to_string());
        Ok(PathBuf::from(session).join(worklet.title()))
    }
}

/// Answers approval requests on the hub
///
/// `respond` maps the request suffix and payload to the response payload.
pub fn spawn_approver<F>(hub: &TopicHub, broker: Arc<ApprovalBroker>, respond: F) -> JoinHandle<()>
where
    F: Fn(&str, &Value) -> Value + Send + 'static,
{
    let mut rx = hub.subscribe();
    tokio::spawn(async move {
        loop {
            let TopicEvent { topic, payload } = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let Some((session, name)) = split_topic(&topic) else {
                continue;
            };
            let reply_topic = match name {
                "topic_approval" => format!("{session}/topic_response"),
                "web_approval" => format!("{session}/web_response"),
                _ => continue,
            };
            broker.deliver(&reply_topic, respond(name, &payload));
        }
    })
}

/// Echo every approval request back unchanged
pub fn echo(_name: &str, payload: &Value) -> Value {
    payload.clone()
}

/// Config with the small knobs the scenarios need
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.max_attempts = 2;
    config.approval_timeout_secs = 5;
    config.status_interval_ms = 20;
    config.switches.generate_reference_keywords = false;
    config
}

pub fn context(config: PipelineConfig, model: Arc<ScriptedModel>, hub: &TopicHub) -> StageContext {
    StageContext::new(
        config,
        model,
        Arc::new(WhitespaceTokenizer),
        Arc::new(hub.clone()),
    )
}

/// Messages published on `{session}/status_update`
pub fn status_messages(events: &[TopicEvent], session: &str) -> Vec<String> {
    let topic = format!("{session}/status_update");
    events
        .iter()
        .filter(|e| e.topic == topic)
        .filter_map(|e| e.payload["message"].as_str().map(str::to_string))
        .collect()
}

/// Drain everything currently buffered on a hub subscription
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<TopicEvent>) -> Vec<TopicEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
