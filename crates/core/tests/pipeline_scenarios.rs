mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use common::{
    drain, echo, spawn_approver, status_messages, test_config, FlakyReferences, MemorySink,
    RecordingSearch, ScriptedModel, StaticLinks,
};
use worklet_core::pipeline::{
    PipelineEvent, PipelineEventKind, PipelineExecutor, PipelineStage, PipelineState,
};
use worklet_core::pubsub::TopicHub;
use worklet_core::tools::ReferenceFinder;

fn collect(mut rx: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_failed_reference_lookup_degrades_only_that_worklet() {
    let hub = TopicHub::default();
    let model = Arc::new(ScriptedModel::new(3, &[]));
    let sink = Arc::new(MemorySink::default());
    let references = ReferenceFinder::new().with_github(Arc::new(FlakyReferences {
        tag: "github",
        fail_on: "Worklet 2".into(),
    }));

    let ctx = Arc::new(
        common::context(test_config(), model.clone(), &hub)
            .with_references(references)
            .with_artifacts(sink.clone()),
    );
    let approver = spawn_approver(&hub, ctx.approvals.clone(), echo);

    let state = PipelineExecutor::new(ctx.clone())
        .run(PipelineState::new("thread-a", 3).with_custom_prompt("edge ocr"))
        .await
        .unwrap();
    approver.abort();

    let titles: Vec<_> = state.worklets.iter().map(|w| w.title().to_string()).collect();
    assert_eq!(titles, vec!["Worklet 1", "Worklet 2", "Worklet 3"]);
    assert!(state.worklets[1].references.is_empty());

    // Ranked [1, 0, 9]: the out-of-range index is dropped
    for idx in [0, 2] {
        let refs = &state.worklets[idx].references;
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].title, format!("Worklet {} second", idx + 1));
    }

    assert_eq!(state.keywords(), ["ocr"]);
    assert_eq!(state.domains(), ["computer vision"]);
    assert_eq!(sink.emitted.lock().unwrap().len(), 3);
    assert_eq!(sink.stored.lock().unwrap().len(), 3);
    assert_eq!(model.max_in_flight(), 1);
    assert_eq!(ctx.approvals.pending_count(), 0);
}

#[tokio::test]
async fn test_zero_approved_queries_skips_web_search() {
    let hub = TopicHub::default();
    let model = Arc::new(ScriptedModel::new(2, &["edge ocr", "rag eval"]));
    let search = Arc::new(RecordingSearch::default());
    let ctx = Arc::new(common::context(test_config(), model.clone(), &hub).with_search(search.clone()));

    let approver = spawn_approver(&hub, ctx.approvals.clone(), |name: &str, payload: &Value| {
        if name == "web_approval" {
            json!({ "queries": [] })
        } else {
            payload.clone()
        }
    });

    let (tx, rx) = mpsc::channel(128);
    let executor = PipelineExecutor::new(ctx).with_event_channel(tx);
    let state = tokio::time::timeout(
        Duration::from_secs(3),
        executor.run(PipelineState::new("thread-b", 2)),
    )
    .await
    .expect("pipeline waited on a skipped stage")
    .unwrap();
    approver.abort();

    assert!(!state.web_search);
    assert!(state.web_search_results.is_empty());
    assert!(state.web_search_queries.is_empty());
    assert!(search.queries.lock().unwrap().is_empty());
    assert_eq!(state.worklets.len(), 2);

    let events = collect(rx);
    assert!(events.iter().any(|e| {
        e.kind == PipelineEventKind::StageSkipped && e.stage == Some(PipelineStage::WebSearch)
    }));
    assert!(!events.iter().any(|e| {
        e.kind == PipelineEventKind::StageStarted && e.stage == Some(PipelineStage::WebSearch)
    }));
    assert_eq!(
        events.last().map(|e| e.kind.clone()),
        Some(PipelineEventKind::PipelineCompleted)
    );
}

#[tokio::test]
async fn test_approved_queries_are_searched_in_order() {
    let hub = TopicHub::default();
    let model = Arc::new(ScriptedModel::new(1, &["  edge ocr ", "", "rag eval"]));
    let search = Arc::new(RecordingSearch::default());
    let ctx = Arc::new(
        common::context(test_config(), model, &hub)
            .with_search(search.clone())
            .with_links(Arc::new(StaticLinks)),
    );
    let approver = spawn_approver(&hub, ctx.approvals.clone(), echo);

    let state = PipelineExecutor::new(ctx)
        .run(PipelineState::new("thread-q", 1).with_links(vec!["https://a.example".into()]))
        .await
        .unwrap();
    approver.abort();

    assert_eq!(state.links_data.len(), 1);
    assert!(state.web_search);
    assert_eq!(state.web_search_queries, vec!["edge ocr", "rag eval"]);
    let queried: Vec<_> = state.web_search_results.iter().map(|r| r.query.as_str()).collect();
    assert_eq!(queried, vec!["edge ocr", "rag eval"]);
    assert_eq!(search.queries.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_stage_error_aborts_with_failure_status() {
    let hub = TopicHub::default();
    let mut status_rx = hub.subscribe();
    let model = Arc::new(ScriptedModel::new(2, &[]).failing_generation());
    let sink = Arc::new(MemorySink::default());
    let ctx = Arc::new(common::context(test_config(), model.clone(), &hub).with_artifacts(sink.clone()));
    let approver = spawn_approver(&hub, ctx.approvals.clone(), echo);

    let (tx, rx) = mpsc::channel(128);
    let result = PipelineExecutor::new(ctx.clone())
        .with_event_channel(tx)
        .run(PipelineState::new("thread-f", 2))
        .await;
    approver.abort();

    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("Worklet generation failed"));

    let generation_calls = model.calls().iter().filter(|c| *c == "worklets").count();
    assert_eq!(generation_calls, 2);
    assert!(sink.emitted.lock().unwrap().is_empty());

    let messages = status_messages(&drain(&mut status_rx), "thread-f");
    assert_eq!(messages.first().map(String::as_str), Some("Initializing pipeline..."));
    assert!(messages
        .last()
        .is_some_and(|m| m.starts_with("Worklet generation failed")));
    assert!(!ctx.status.is_active().await);

    let events = collect(rx);
    let failed = events.last().unwrap();
    assert_eq!(failed.kind, PipelineEventKind::PipelineFailed);
    assert_eq!(failed.stage, Some(PipelineStage::GenerateWorklets));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_approvals_time_out_and_pipeline_continues() {
    let hub = TopicHub::default();
    let model = Arc::new(ScriptedModel::new(1, &["edge ocr"]));
    let search = Arc::new(RecordingSearch::default());
    let mut config = test_config();
    config.approval_timeout_secs = 300;
    config.status_interval_ms = 500;
    let ctx = Arc::new(common::context(config, model, &hub).with_search(search.clone()));

    let state = PipelineExecutor::new(ctx.clone())
        .run(PipelineState::new("thread-t", 1).with_cluster("AI Domain"))
        .await
        .unwrap();

    assert!(state.keywords().is_empty());
    assert!(state.domains().is_empty());
    assert!(!state.web_search);
    assert!(search.queries.lock().unwrap().is_empty());
    assert_eq!(state.worklets.len(), 1);
    assert_eq!(ctx.approvals.pending_count(), 0);
}

#[tokio::test]
async fn test_cluster_terms_offered_for_approval() {
    let hub = TopicHub::default();
    let mut rx = hub.subscribe();
    let model = Arc::new(ScriptedModel::new(1, &[]));
    let mut config = test_config();
    config.switches.extract_keywords_domains = false;
    let ctx = Arc::new(common::context(config, model.clone(), &hub));
    let approver = spawn_approver(&hub, ctx.approvals.clone(), echo);

    let state = PipelineExecutor::new(ctx)
        .run(PipelineState::new("thread-c", 1).with_cluster("Image Parsing"))
        .await
        .unwrap();
    approver.abort();

    assert!(!model.calls().iter().any(|c| c == "keywords"));
    assert_eq!(state.keywords(), ["gemma", "image parsing", "vision model", "ocr"]);
    assert_eq!(state.domains(), ["computer vision", "image analysis"]);

    let request = drain(&mut rx)
        .into_iter()
        .find(|e| e.topic == "thread-c/topic_approval")
        .unwrap();
    assert_eq!(
        request.payload["message"],
        "Keyword and domain extraction is disabled."
    );
}

#[tokio::test]
async fn test_undrained_event_channel_does_not_stall_pipeline() {
    let hub = TopicHub::default();
    let model = Arc::new(ScriptedModel::new(1, &[]));
    let ctx = Arc::new(common::context(test_config(), model, &hub));
    let approver = spawn_approver(&hub, ctx.approvals.clone(), echo);

    // Capacity one and never read while the run is in progress
    let (tx, mut rx) = mpsc::channel(1);
    let executor = PipelineExecutor::new(ctx).with_event_channel(tx);
    let state = tokio::time::timeout(
        Duration::from_secs(3),
        executor.run(PipelineState::new("thread-e", 1)),
    )
    .await
    .expect("pipeline blocked on a full event channel")
    .unwrap();
    approver.abort();

    assert_eq!(state.worklets.len(), 1);
    let first = rx.try_recv().unwrap();
    assert_eq!(first.kind, PipelineEventKind::PipelineStarted);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_dropped_event_receiver_is_detached() {
    let hub = TopicHub::default();
    let model = Arc::new(ScriptedModel::new(1, &[]));
    let ctx = Arc::new(common::context(test_config(), model, &hub));
    let approver = spawn_approver(&hub, ctx.approvals.clone(), echo);

    let (tx, rx) = mpsc::channel(4);
    drop(rx);
    let state = PipelineExecutor::new(ctx)
        .with_event_channel(tx)
        .run(PipelineState::new("thread-d", 1))
        .await
        .unwrap();
    approver.abort();

    assert_eq!(state.worklets.len(), 1);
}
