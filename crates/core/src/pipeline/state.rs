//! # Pipeline State
//!
//! The single record threaded through every stage of one workflow. Stages
//! run strictly in order on the task that owns the state, so it carries no
//! locks; each field is written by exactly one stage and read-only after.
//!
//! | Field                   | Written by        |
//! |-------------------------|-------------------|
//! | inputs                  | caller            |
//! | `links_data`            | process input     |
//! | `keywords_domains`      | keyword extraction|
//! | `web_search_queries`    | query planning    |
//! | `web_search(_results)`  | web search        |
//! | `generation_output`     | generation        |
//! | `worklets`              | references, ranking |

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::outputs::{GeneratedWorklet, WorkletGenerationResult};
use crate::tools::references::Reference;
use crate::tools::search::{LinkData, SearchResult};

/// Extracted text of an uploaded document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDocument {
    pub file_name: String,
    pub text: String,
}

impl InputDocument {
    pub fn new(file_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            text: text.into(),
        }
    }

    /// Size of the text in bytes
    pub fn size(&self) -> usize {
        self.text.len()
    }
}

/// Approved keywords and domains, flattened across sources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordsDomains {
    pub keywords: Vec<String>,
    pub domains: Vec<String>,
}

/// A generated worklet with its identity and references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worklet {
    pub worklet_id: Uuid,
    #[serde(flatten)]
    pub content: GeneratedWorklet,
    #[serde(default)]
    pub references: Vec<Reference>,
}

impl Worklet {
    pub fn new(content: GeneratedWorklet, references: Vec<Reference>) -> Self {
        Self {
            worklet_id: Uuid::new_v4(),
            content,
            references,
        }
    }

    pub fn title(&self) -> &str {
        &self.content.title
    }

    /// Replace typographic characters in the generated text
    pub fn normalize_text(&mut self) {
        self.content.normalize_text();
    }
}

/// Mutable record for one workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Correlates approvals and status messages with this workflow
    pub session_key: String,
    /// How many worklets to generate
    pub count: usize,
    pub documents: Vec<InputDocument>,
    pub links: Vec<String>,
    pub links_data: Vec<LinkData>,
    pub custom_prompt: Option<String>,
    pub cluster_name: Option<String>,
    pub keywords_domains: Option<KeywordsDomains>,
    pub web_search: bool,
    pub web_search_queries: Vec<String>,
    pub web_search_results: Vec<SearchResult>,
    pub generation_output: Option<WorkletGenerationResult>,
    pub worklets: Vec<Worklet>,
}

impl PipelineState {
    /// A fresh state with only the inputs populated
    pub fn new(session_key: impl Into<String>, count: usize) -> Self {
        Self {
            session_key: session_key.into(),
            count,
            ..Default::default()
        }
    }

    pub fn with_documents(mut self, documents: Vec<InputDocument>) -> Self {
        self.documents = documents;
        self
    }

    pub fn with_links(mut self, links: Vec<String>) -> Self {
        self.links = links;
        self
    }

    pub fn with_custom_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }

    pub fn with_cluster(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = Some(cluster_name.into());
        self
    }

    pub fn keywords(&self) -> &[String] {
        self.keywords_domains
            .as_ref()
            .map(|kd| kd.keywords.as_slice())
            .unwrap_or_default()
    }

    pub fn domains(&self) -> &[String] {
        self.keywords_domains
            .as_ref()
            .map(|kd| kd.domains.as_slice())
            .unwrap_or_default()
    }

    pub fn instruction(&self) -> &str {
        self.custom_prompt.as_deref().unwrap_or_default()
    }

    /// Reset the web search fields to "no search performed"
    pub fn clear_web_search(&mut self) {
        self.web_search = false;
        self.web_search_results.clear();
    }
}
