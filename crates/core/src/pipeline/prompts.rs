//! Prompt builders for each model call.
//!
//! Builders take an already-fitted state; they never trim.

use crate::llm::outputs::GeneratedWorklet;
use crate::llm::Prompt;
use crate::tools::Reference;

use super::state::PipelineState;

/// Advisor role shared by the worklet prompts
pub const ADVISOR: &str = "You are a technology and innovation advisor. You propose \
    student research projects (worklets) grounded in the material you are given.";

const EXTRACTION: &str = "Extract concise technical keywords (1-3 words each) and broad \
    application or research domains from each source: existing worklets, link content and \
    the custom prompt. Return empty lists for sources that were not provided. Deduplicate.";

const QUERY_PLANNING: &str = "Decide whether web research would improve the worklets. If it \
    would, return a short list of focused web search queries; otherwise return an empty list.";

const GENERATION: &str = "Generate exactly {count} worklets. Each needs a title, problem \
    statement, description, challenge or use case, deliverables, KPIs, prerequisites, \
    infrastructure requirements, tech stack and milestones keyed by month.";

const REFERENCE_KEYWORDS: &str = "Produce two short search phrases for the topic below: one \
    for Google Scholar (the research core) and one for GitHub (implementation terms).";

const RANKING: &str = "Sort the references by relevance to the project, most relevant first. \
    Return only their 0-based indices.";

const FIELD_ITERATION: &str = "You refine a single field of a worklet. Update only the \
    named field, keep it aligned with the intent of the rest of the worklet and the \
    instruction, and answer without explanations or markdown.";

const ENHANCEMENT: &str = "You revise a whole worklet according to the instruction. Keep \
    it coherent, update every field the instruction touches, write plain text with \
    bullet-style list items, stay near 160 words per field and do not invent references.";

fn section(out: &mut String, title: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }
    out.push_str("### ");
    out.push_str(title);
    out.push('\n');
    out.push_str(body);
    out.push_str("\n\n");
}

fn documents(state: &PipelineState) -> String {
    state
        .documents
        .iter()
        .map(|doc| format!("[{}]\n{}", doc.file_name, doc.text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn links(state: &PipelineState) -> String {
    state
        .links_data
        .iter()
        .map(|link| link.prompt_text())
        .collect::<Vec<_>>()
        .join("\n")
}

fn search_results(state: &PipelineState) -> String {
    state
        .web_search_results
        .iter()
        .map(|result| result.prompt_text())
        .collect::<Vec<_>>()
        .join("\n")
}

fn topics(state: &PipelineState, out: &mut String) {
    section(out, "Keywords", &state.keywords().join(", "));
    section(out, "Domains", &state.domains().join(", "));
}

pub fn keyword_extraction(state: &PipelineState) -> Prompt {
    let mut inputs = String::new();
    section(&mut inputs, "Existing worklets", &documents(state));
    section(&mut inputs, "Link content", &links(state));
    section(&mut inputs, "Custom prompt", state.instruction());

    Prompt::new()
        .system(ADVISOR)
        .system(EXTRACTION)
        .user(inputs)
}

pub fn query_planning(state: &PipelineState) -> Prompt {
    let mut inputs = String::new();
    topics(state, &mut inputs);
    section(&mut inputs, "Existing worklets", &documents(state));
    section(&mut inputs, "Link content", &links(state));
    section(&mut inputs, "Custom prompt", state.instruction());

    Prompt::new()
        .system(ADVISOR)
        .system(QUERY_PLANNING.to_string() + &format!(" Worklets requested: {}.", state.count))
        .user(inputs)
}

pub fn worklet_generation(state: &PipelineState) -> Prompt {
    let mut inputs = String::new();
    topics(state, &mut inputs);
    section(&mut inputs, "Existing worklets", &documents(state));
    section(&mut inputs, "Link content", &links(state));
    section(&mut inputs, "Web search results", &search_results(state));
    section(&mut inputs, "Custom prompt", state.instruction());

    Prompt::new()
        .system(ADVISOR)
        .system(GENERATION.replace("{count}", &state.count.to_string()))
        .user(inputs)
}

pub fn reference_keywords(topic: &str) -> Prompt {
    Prompt::new()
        .system(REFERENCE_KEYWORDS)
        .user(format!("Topic: {}", topic))
}

pub fn reference_ranking(title: &str, description: &str, references: &[Reference]) -> Prompt {
    let listed = references
        .iter()
        .enumerate()
        .map(|(idx, reference)| format!("{}. {}", idx, reference.prompt_text()))
        .collect::<Vec<_>>()
        .join("\n");

    Prompt::new()
        .system(RANKING)
        .user(format!(
            "Title: {}\nDescription: {}\n\nReferences:\n{}",
            title, description, listed
        ))
}

pub fn field_iteration(
    worklet: &GeneratedWorklet,
    field: &str,
    shape: &str,
    instruction: &str,
) -> serde_json::Result<Prompt> {
    let mut inputs = String::new();
    section(&mut inputs, "Current worklet", &serde_json::to_string_pretty(worklet)?);
    section(&mut inputs, "Field", &format!("{field}: return {shape}"));
    section(&mut inputs, "Instruction", instruction);

    Ok(Prompt::new()
        .system(ADVISOR)
        .system(FIELD_ITERATION)
        .user(inputs))
}

pub fn worklet_enhancement(worklet: &GeneratedWorklet, instruction: &str) -> serde_json::Result<Prompt> {
    let mut inputs = String::new();
    section(&mut inputs, "Current worklet", &serde_json::to_string_pretty(worklet)?);
    section(&mut inputs, "Instruction", instruction);

    Ok(Prompt::new()
        .system(ADVISOR)
        .system(ENHANCEMENT)
        .user(inputs))
}
