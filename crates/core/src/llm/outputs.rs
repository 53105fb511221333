//! Typed outputs of the structured model calls: the five pipeline calls plus
//! the field responses used when revising a worklet.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::StructuredOutput;

/// Terms split by where they were found
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Sources {
    /// Terms found in the uploaded documents
    pub worklet: Vec<String>,
    /// Terms found in the linked pages
    pub link: Vec<String>,
    /// Terms found in the user's instruction
    pub custom_prompt: Vec<String>,
}

impl Sources {
    /// All terms in source order (worklet, link, custom_prompt)
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.worklet
            .iter()
            .chain(self.link.iter())
            .chain(self.custom_prompt.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.worklet.is_empty() && self.link.is_empty() && self.custom_prompt.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KeywordsExtractionResult {
    pub keywords: Sources,
    pub domains: Sources,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WebSearchQueryResult {
    /// Ordered list of queries to run during web search
    pub web_search_queries: Vec<String>,
}

/// One generated project idea, before an id and references are attached
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedWorklet {
    /// Title of the project idea
    pub title: String,
    /// Problem statement (min 50 words)
    pub problem_statement: String,
    /// Context and background (max 100 words)
    pub description: String,
    /// Why this worklet was proposed
    #[serde(default)]
    pub reasoning: String,
    /// At least 2 use cases or scenarios addressed
    pub challenge_use_case: String,
    pub deliverables: Vec<String>,
    pub kpis: Vec<String>,
    pub prerequisites: Vec<String>,
    pub infrastructure_requirements: String,
    /// Tentative technology stack
    pub tech_stack: String,
    /// Milestones over a 6-month period
    pub milestones: BTreeMap<String, Value>,
}

impl GeneratedWorklet {
    /// Replace typographic characters models like to emit
    ///
    /// Non-breaking hyphen becomes `-`, narrow no-break space becomes a space.
    pub fn normalize_text(&mut self) {
        fn fix(text: &mut String) {
            if text.contains(|ch: char| ch == '\u{2011}' || ch == '\u{202f}') {
                *text = text.replace('\u{2011}', "-").replace('\u{202f}', " ");
            }
        }

        for field in [
            &mut self.title,
            &mut self.problem_statement,
            &mut self.description,
            &mut self.reasoning,
            &mut self.challenge_use_case,
            &mut self.infrastructure_requirements,
            &mut self.tech_stack,
        ] {
            fix(field);
        }
        for list in [&mut self.deliverables, &mut self.kpis, &mut self.prerequisites] {
            list.iter_mut().for_each(fix);
        }
        for value in self.milestones.values_mut() {
            if let Value::String(text) = value {
                fix(text);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkletGenerationResult {
    pub worklets: Vec<GeneratedWorklet>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceKeywordResult {
    /// Phrase for searching academic papers
    pub google_scholar_keyword: String,
    /// Phrase for searching repositories
    pub github_keyword: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceSortingResult {
    /// 0-indexed positions of the references, most relevant first
    pub sorted_indices: Vec<usize>,
}

/// Revised value of a text field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StringFieldResponse {
    pub updated_value: String,
}

/// Revised value of a list field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArrayFieldResponse {
    pub updated_value: Vec<String>,
}

/// Revised value of a map field (milestones keyed by timeframe)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ObjectFieldResponse {
    pub updated_value: BTreeMap<String, Value>,
}

impl StructuredOutput for KeywordsExtractionResult {}
impl StructuredOutput for WebSearchQueryResult {}
impl StructuredOutput for WorkletGenerationResult {}
impl StructuredOutput for ReferenceKeywordResult {}
impl StructuredOutput for ReferenceSortingResult {}
impl StructuredOutput for GeneratedWorklet {}
impl StructuredOutput for StringFieldResponse {}
impl StructuredOutput for ArrayFieldResponse {}
impl StructuredOutput for ObjectFieldResponse {}
