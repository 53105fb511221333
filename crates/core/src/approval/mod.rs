//! # Approval Gate
//!
//! Human sign-off on extracted keywords/domains and on planned web search
//! queries. The broker does the correlation; the helpers here shape the two
//! payloads and read the approver's answer back.
//!
//! Payloads on the wire:
//!
//! ```text
//! {session}/topic_approval  {"domains": {...}, "keywords": {...}, "message": "..."}
//! {session}/topic_response  {"domains": {source: [..]}, "keywords": {source: [..]}}
//! {session}/web_approval    {"queries": [..]}
//! {session}/web_response    {"queries": [..]}
//! ```

pub mod broker;

pub use broker::{ApprovalBroker, ApprovalKind, ApprovalOutcome, DEFAULT_APPROVAL_TIMEOUT};

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::ApprovalError;
use crate::llm::outputs::KeywordsExtractionResult;
use crate::pipeline::state::KeywordsDomains;

/// Source keys in the order their terms are flattened
const SOURCE_ORDER: [&str; 3] = ["worklet", "link", "custom_prompt"];

/// Ask the approver to confirm keywords and domains
///
/// A timeout or an empty answer yields empty keyword and domain lists.
pub async fn approve_keywords(
    broker: &ApprovalBroker,
    session: &str,
    extracted: &KeywordsExtractionResult,
    message: &str,
    timeout: Duration,
) -> Result<KeywordsDomains, ApprovalError> {
    let payload = json!({
        "domains": extracted.domains,
        "keywords": extracted.keywords,
        "message": message,
    });

    let response = broker
        .request_approval(session, ApprovalKind::Topics, payload, timeout)
        .await?
        .into_payload();

    Ok(KeywordsDomains {
        keywords: flatten_sources(response.get("keywords")),
        domains: flatten_sources(response.get("domains")),
    })
}

/// Ask the approver to confirm web search queries
pub async fn approve_queries(
    broker: &ApprovalBroker,
    session: &str,
    queries: &[String],
    timeout: Duration,
) -> Result<Vec<String>, ApprovalError> {
    let response = broker
        .request_approval(
            session,
            ApprovalKind::WebQueries,
            json!({ "queries": queries }),
            timeout,
        )
        .await?
        .into_payload();

    let mut approved = Vec::new();
    push_terms(&mut approved, response.get("queries"));
    Ok(approved)
}

/// Flatten `{source: [terms]}` into one list in source order
///
/// Known sources come first, then any others the approver added. Blank and
/// repeated terms are dropped.
pub fn flatten_sources(sources: Option<&Value>) -> Vec<String> {
    let Some(map) = sources.and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut terms = Vec::new();
    for key in SOURCE_ORDER {
        push_terms(&mut terms, map.get(key));
    }
    for (key, value) in map {
        if !SOURCE_ORDER.contains(&key.as_str()) {
            push_terms(&mut terms, Some(value));
        }
    }
    terms
}

fn push_terms(terms: &mut Vec<String>, list: Option<&Value>) {
    let Some(items) = list.and_then(Value::as_array) else {
        return;
    };
    for term in items.iter().filter_map(Value::as_str).map(str::trim) {
        if !term.is_empty() && !terms.iter().any(|t| t == term) {
            terms.push(term.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::outputs::Sources;
    use crate::pubsub::TopicHub;
    use std::sync::Arc;

    #[test]
    fn test_flatten_sources_order_and_blanks() {
        let value = json!({
            "custom_prompt": ["ocr", " "],
            "worklet": ["rag", "ocr"],
            "link": ["vision"],
            "extra": ["edge"]
        });
        assert_eq!(
            flatten_sources(Some(&value)),
            vec!["rag", "ocr", "vision", "edge"]
        );
        assert!(flatten_sources(None).is_empty());
        assert!(flatten_sources(Some(&json!("rag"))).is_empty());
    }

    #[tokio::test]
    async fn test_approve_keywords_round_trip() {
        let hub = TopicHub::default();
        let broker = Arc::new(ApprovalBroker::new(Arc::new(hub.clone())));
        let mut rx = hub.subscribe();

        let extracted = KeywordsExtractionResult {
            keywords: Sources {
                worklet: vec!["rag".into()],
                ..Default::default()
            },
            domains: Sources::default(),
        };

        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let request = rx.recv().await.unwrap();
                assert_eq!(request.topic, "s/topic_approval");
                assert_eq!(request.payload["keywords"]["worklet"][0], "rag");
                assert_eq!(request.payload["message"], "review");
                broker.deliver(
                    "s/topic_response",
                    json!({
                        "keywords": {"worklet": ["rag", ""], "custom_prompt": ["genai"]},
                        "domains": {"link": ["machine learning"]}
                    }),
                )
            })
        };

        let approved = approve_keywords(&broker, "s", &extracted, "review", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(responder.await.unwrap());
        assert_eq!(approved.keywords, vec!["rag", "genai"]);
        assert_eq!(approved.domains, vec!["machine learning"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_approve_queries_timeout_is_empty() {
        let broker = ApprovalBroker::new(Arc::new(TopicHub::default()));
        let approved = approve_queries(&broker, "s", &["q".to_string()], Duration::from_secs(300))
            .await
            .unwrap();
        assert!(approved.is_empty());
    }
}
