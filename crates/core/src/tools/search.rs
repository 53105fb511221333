//! # Search - Web Search and Link Extraction
//!
//! Collaborator seams for web research plus a Tavily-backed default.
//! Upstream calls retry with a fixed delay; a call that still fails degrades
//! to an empty result instead of failing the stage.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::llm::retry::RetryPolicy;

const TAVILY_API: &str = "https://api.tavily.com";

/// One hit returned by a web search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
}

/// Results for one query; failed searches keep their slot with no answer or hits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub results: Vec<SearchHit>,
}

impl SearchResult {
    pub fn empty(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            answer: None,
            results: Vec::new(),
        }
    }

    /// Hit contents joined with spaces
    pub fn body(&self) -> String {
        self.results
            .iter()
            .map(|hit| hit.content.as_str())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Text as it appears in prompts and is counted by the budgeter
    pub fn prompt_text(&self) -> String {
        let mut text = format!("Query: {}", self.query);
        if let Some(answer) = self.answer.as_deref().filter(|a| !a.is_empty()) {
            text.push_str(" | ");
            text.push_str(answer);
        }
        let body = self.body();
        if !body.is_empty() {
            text.push_str(" | ");
            text.push_str(&body);
        }
        text
    }
}

/// Text extracted from a user-supplied link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkData {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "raw_content")]
    pub content: String,
}

impl LinkData {
    /// Text as it appears in prompts and is counted by the budgeter
    pub fn prompt_text(&self) -> String {
        [self.title.as_str(), self.content.as_str(), self.url.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Search the web; `None` when the search could not be performed
    async fn search(&self, query: &str, max_results: usize) -> Option<SearchResult>;
}

#[async_trait]
pub trait LinkExtractor: Send + Sync {
    /// Extract page text for each url; unreachable pages are omitted
    async fn extract(&self, urls: &[String]) -> Vec<LinkData>;
}

/// Run one search per query concurrently, keeping query order
pub async fn parallel_search(
    search: &dyn WebSearch,
    queries: &[String],
    max_results: usize,
) -> Vec<SearchResult> {
    let results = join_all(queries.iter().map(|q| search.search(q, max_results))).await;

    queries
        .iter()
        .zip(results)
        .map(|(query, result)| match result {
            Some(mut found) => {
                if found.query.is_empty() {
                    found.query = query.clone();
                }
                found
            }
            None => SearchResult::empty(query.clone()),
        })
        .collect()
}

/// Tavily search and extract API
#[derive(Debug, Clone)]
pub struct TavilyClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
    include_answer: bool,
}

#[derive(Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    results: Vec<LinkData>,
}

impl TavilyClient {
    pub fn new(api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: TAVILY_API.to_string(),
            retry: RetryPolicy::upstream(),
            include_answer: true,
        })
    }

    /// Read `TAVILY_API_KEY`; `None` when unset or blank
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("TAVILY_API_KEY").ok()?;
        if key.trim().is_empty() {
            return None;
        }
        match Self::new(key) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("Failed to create Tavily client: {}", e);
                None
            }
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Ask for hits only, without a synthesized answer
    pub fn without_answer(mut self) -> Self {
        self.include_answer = false;
        self
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<T> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl WebSearch for TavilyClient {
    async fn search(&self, query: &str, max_results: usize) -> Option<SearchResult> {
        let body = json!({
            "query": query,
            "search_depth": "advanced",
            "max_results": max_results,
            "include_answer": if self.include_answer { json!("advanced") } else { json!(false) },
        });

        let result = self
            .retry
            .run("tavily search", |_| self.post::<SearchResult>("search", &body))
            .await;

        match result {
            Ok(found) => Some(found),
            Err(e) => {
                tracing::warn!(query, "Tavily search failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl LinkExtractor for TavilyClient {
    async fn extract(&self, urls: &[String]) -> Vec<LinkData> {
        if urls.is_empty() {
            return Vec::new();
        }
        let body = json!({ "urls": urls, "extract_depth": "advanced" });

        let result = self
            .retry
            .run("tavily extract", |_| self.post::<ExtractResponse>("extract", &body))
            .await;

        match result {
            Ok(response) => response.results,
            Err(e) => {
                tracing::warn!("Tavily extract failed: {}", e);
                Vec::new()
            }
        }
    }
}
