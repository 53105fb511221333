//! # Stage Functions
//!
//! One async function per stage. Each takes the state by value and hands it
//! back, so only the running stage can write to it. Stage-level failures
//! return an error and abort the workflow; failures of a single worklet in
//! a fan-out stage degrade that worklet only.

use anyhow::{Context, Result};
use futures::future::join_all;

use super::context::StageContext;
use super::prompts;
use super::state::{PipelineState, Worklet};
use crate::approval::{approve_keywords, approve_queries};
use crate::config::PromptKind;
use crate::llm::outputs::{
    GeneratedWorklet, KeywordsExtractionResult, ReferenceKeywordResult, ReferenceSortingResult,
    WebSearchQueryResult, WorkletGenerationResult,
};
use crate::pubsub::{session_topic, STATUS_UPDATE};
use crate::tools::{cluster_terms, parallel_search, Reference};

/// Hits requested per approved web search query
pub const SEARCH_RESULTS: usize = 5;

const REVIEW_MESSAGE: &str =
    "Please review and approve the following domains and keywords for the worklet generation process.";
const EXTRACTION_DISABLED_MESSAGE: &str = "Keyword and domain extraction is disabled.";

/// Publish `message` as the session's current status
pub(crate) async fn announce(ctx: &StageContext, state: &PipelineState, message: impl Into<String>) {
    ctx.status
        .set_message(message, Some(session_topic(&state.session_key, STATUS_UPDATE)))
        .await;
}

/// Extract the text behind the input links
#[tracing::instrument(skip_all, fields(session = %state.session_key))]
pub async fn process_input(ctx: &StageContext, mut state: PipelineState) -> Result<PipelineState> {
    if state.links.is_empty() {
        return Ok(state);
    }
    let Some(extractor) = &ctx.links else {
        tracing::warn!(links = state.links.len(), "No link extractor configured, ignoring links");
        return Ok(state);
    };

    announce(ctx, &state, "Extracting data from links...").await;
    state.links_data = extractor.extract(&state.links).await;
    if state.links_data.is_empty() {
        tracing::warn!("No data extracted from links");
    }
    tracing::info!(
        documents = state.documents.len(),
        links = state.links_data.len(),
        "Input processed"
    );
    Ok(state)
}

/// Propose keywords and domains, merge cluster terms, wait for approval
#[tracing::instrument(skip_all, fields(session = %state.session_key))]
pub async fn extract_keywords_domains(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState> {
    let enabled = ctx.config.switches.extract_keywords_domains;

    let mut extracted = if enabled {
        announce(ctx, &state, "Extracting keywords and domains...").await;
        let limits = ctx.config.limits_for(PromptKind::Extraction)?;
        let fitted = ctx.budgeter.fit(&state, &limits);
        let prompt = prompts::keyword_extraction(&fitted.value);
        ctx.invoker
            .invoke::<KeywordsExtractionResult>(&ctx.config.models.keyword_extraction, &prompt)
            .await
            .context("Keyword extraction failed")?
    } else {
        KeywordsExtractionResult::default()
    };

    if let Some(cluster) = state.cluster_name.as_deref().and_then(cluster_terms) {
        merge_terms(&mut extracted.keywords.custom_prompt, cluster.keywords);
        merge_terms(&mut extracted.domains.custom_prompt, cluster.domains);
    }

    let message = if enabled {
        REVIEW_MESSAGE
    } else {
        EXTRACTION_DISABLED_MESSAGE
    };
    let approved = approve_keywords(
        &ctx.approvals,
        &state.session_key,
        &extracted,
        message,
        ctx.config.approval_timeout(),
    )
    .await
    .context("Keyword approval failed")?;

    tracing::info!(
        keywords = approved.keywords.len(),
        domains = approved.domains.len(),
        "Keywords and domains approved"
    );
    state.keywords_domains = Some(approved);
    Ok(state)
}

fn merge_terms(terms: &mut Vec<String>, extra: &[&str]) {
    for term in extra {
        if !terms.iter().any(|t| t == term) {
            terms.push(term.to_string());
        }
    }
}

/// Trim and drop blank queries, keeping order
pub fn clean_queries(queries: Vec<String>) -> Vec<String> {
    queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect()
}

/// Plan web search queries and have them approved
///
/// Leaves `web_search_queries` empty when the model proposes nothing or the
/// approver rejects every query.
#[tracing::instrument(skip_all, fields(session = %state.session_key))]
pub async fn plan_web_search(ctx: &StageContext, mut state: PipelineState) -> Result<PipelineState> {
    state.clear_web_search();
    state.web_search_queries.clear();

    announce(ctx, &state, "Gathering web search queries...").await;
    let limits = ctx.config.limits_for(PromptKind::QueryPlanning)?;
    let fitted = ctx.budgeter.fit(&state, &limits);
    let prompt = prompts::query_planning(&fitted.value);
    let planned = ctx
        .invoker
        .invoke::<WebSearchQueryResult>(&ctx.config.models.query_planning, &prompt)
        .await
        .context("Web search query planning failed")?;

    let queries = clean_queries(planned.web_search_queries);
    tracing::info!(queries = queries.len(), "Web search queries planned");
    if queries.is_empty() {
        return Ok(state);
    }

    let approved = approve_queries(
        &ctx.approvals,
        &state.session_key,
        &queries,
        ctx.config.approval_timeout(),
    )
    .await
    .context("Web search approval failed")?;

    state.web_search_queries = clean_queries(approved);
    if state.web_search_queries.is_empty() {
        tracing::info!("No web search queries approved");
    }
    Ok(state)
}

/// Run every approved query concurrently
#[tracing::instrument(skip_all, fields(session = %state.session_key))]
pub async fn web_search(ctx: &StageContext, mut state: PipelineState) -> Result<PipelineState> {
    if state.web_search_queries.is_empty() {
        state.clear_web_search();
        return Ok(state);
    }
    let Some(search) = &ctx.search else {
        tracing::warn!("No web search configured, skipping search");
        state.clear_web_search();
        return Ok(state);
    };

    announce(ctx, &state, "Web search invoked...").await;
    state.web_search = true;
    state.web_search_results =
        parallel_search(search.as_ref(), &state.web_search_queries, SEARCH_RESULTS).await;

    let failed = state
        .web_search_results
        .iter()
        .filter(|r| r.answer.is_none() && r.results.is_empty())
        .count();
    if failed > 0 {
        tracing::warn!(failed, "Some web searches returned nothing");
    }
    announce(ctx, &state, "Web search completed.").await;
    Ok(state)
}

#[tracing::instrument(skip_all, fields(session = %state.session_key, count = state.count))]
pub async fn generate_worklets(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState> {
    announce(ctx, &state, "Generating worklets...").await;
    let limits = ctx.config.limits_for(PromptKind::Generation)?;
    let fitted = ctx.budgeter.fit(&state, &limits);
    let prompt = prompts::worklet_generation(&fitted.value);

    let generated = ctx
        .invoker
        .invoke::<WorkletGenerationResult>(&ctx.config.models.generation, &prompt)
        .await
        .context("Worklet generation failed")?;

    tracing::info!(generated = generated.worklets.len(), "Worklets generated");
    state.generation_output = Some(generated);
    Ok(state)
}

/// Look up references for every generated worklet concurrently
#[tracing::instrument(skip_all, fields(session = %state.session_key))]
pub async fn attach_references(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState> {
    let generated = match &state.generation_output {
        Some(output) if !output.worklets.is_empty() => output.worklets.clone(),
        _ => return Ok(state),
    };

    let tasks = generated
        .into_iter()
        .enumerate()
        .map(|(idx, worklet)| references_for(ctx, &state, idx, worklet));
    let worklets = join_all(tasks).await;
    state.worklets = worklets;
    Ok(state)
}

async fn references_for(
    ctx: &StageContext,
    state: &PipelineState,
    idx: usize,
    worklet: GeneratedWorklet,
) -> Worklet {
    announce(
        ctx,
        state,
        format!("Generating references for worklet: {}...", worklet.title),
    )
    .await;

    let fallback = ReferenceKeywordResult {
        google_scholar_keyword: worklet.title.clone(),
        github_keyword: worklet.title.clone(),
    };
    let keywords = if ctx.config.switches.generate_reference_keywords {
        let topic = if worklet.title.trim().is_empty() {
            &worklet.problem_statement
        } else {
            &worklet.title
        };
        let prompt = prompts::reference_keywords(topic);
        match ctx
            .invoker
            .invoke::<ReferenceKeywordResult>(ctx.config.reference_keywords_for(idx), &prompt)
            .await
        {
            Ok(keywords) => keywords,
            Err(e) => {
                tracing::warn!(worklet = idx, "Reference keyword generation failed: {}", e);
                fallback
            }
        }
    } else {
        fallback
    };

    let references = match ctx.references.find(&keywords).await {
        Ok(references) => references,
        Err(e) => {
            tracing::warn!(worklet = idx, "Reference lookup failed: {:#}", e);
            Vec::new()
        }
    };
    Worklet::new(worklet, references)
}

/// Reorder references by `indices`, dropping out-of-range and repeated ones
pub fn apply_ranking(references: &[Reference], indices: &[usize]) -> Vec<Reference> {
    let mut seen = vec![false; references.len()];
    indices
        .iter()
        .filter_map(|&i| {
            let slot = seen.get_mut(i)?;
            if *slot {
                return None;
            }
            *slot = true;
            references.get(i).cloned()
        })
        .collect()
}

/// Have the model order each worklet's references
#[tracing::instrument(skip_all, fields(session = %state.session_key))]
pub async fn rank_references(
    ctx: &StageContext,
    mut state: PipelineState,
) -> Result<PipelineState> {
    if state.worklets.is_empty() {
        return Ok(state);
    }
    let limits = ctx.config.limits_for(PromptKind::Ranking)?;

    let worklets = std::mem::take(&mut state.worklets);
    let tasks = worklets.into_iter().enumerate().map(|(idx, mut worklet)| {
        let state = &state;
        async move {
            if worklet.references.is_empty() {
                return worklet;
            }
            announce(
                ctx,
                state,
                format!("Ranking references for worklet: {}...", worklet.title()),
            )
            .await;

            let fitted = ctx.budgeter.fit_references(&worklet.references, &limits);
            let prompt = prompts::reference_ranking(
                worklet.title(),
                &worklet.content.description,
                &fitted.value,
            );
            match ctx
                .invoker
                .invoke::<ReferenceSortingResult>(ctx.config.reference_ranking_for(idx), &prompt)
                .await
            {
                Ok(sorted) => {
                    // Indices address the fitted list, a prefix of the original
                    let ranked = &worklet.references[..fitted.value.len()];
                    worklet.references = apply_ranking(ranked, &sorted.sorted_indices);
                    worklet.normalize_text();
                    tracing::debug!(worklet = idx, indices = ?sorted.sorted_indices, "References ranked");
                }
                Err(e) => {
                    tracing::warn!(worklet = idx, "Reference ranking failed, keeping order: {}", e);
                }
            }
            worklet
        }
    });

    let ranked = join_all(tasks).await;
    state.worklets = ranked;
    Ok(state)
}

/// Hand the finished worklets to the artifact sink
#[tracing::instrument(skip_all, fields(session = %state.session_key))]
pub async fn emit_files(ctx: &StageContext, state: PipelineState) -> Result<PipelineState> {
    if state.worklets.is_empty() {
        return Ok(state);
    }
    let Some(sink) = &ctx.artifacts else {
        tracing::debug!("No artifact sink configured");
        return Ok(state);
    };

    announce(ctx, &state, "Generating files...").await;
    sink.store(&state.session_key, &state.worklets)
        .await
        .context("Storing worklets failed")?;
    for worklet in &state.worklets {
        let path = sink
            .emit(&state.session_key, worklet)
            .await
            .with_context(|| format!("Writing worklet '{}' failed", worklet.title()))?;
        tracing::debug!(path = %path.display(), "Worklet written");
    }
    tracing::info!(files = state.worklets.len(), "Files generated");
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(title: &str) -> Reference {
        Reference {
            title: title.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_ranking_drops_bad_indices() {
        let refs = vec![reference("a"), reference("b"), reference("c")];
        let ranked = apply_ranking(&refs, &[2, 7, 0, 2, 1]);
        let titles: Vec<_> = ranked.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_apply_ranking_keeps_only_listed() {
        let refs = vec![reference("a"), reference("b"), reference("c")];
        assert_eq!(apply_ranking(&refs, &[1]), vec![reference("b")]);
        assert!(apply_ranking(&refs, &[]).is_empty());
    }

    #[test]
    fn test_clean_queries() {
        let cleaned = clean_queries(vec![
            "  edge ocr ".into(),
            "".into(),
            "   ".into(),
            "rag eval".into(),
        ]);
        assert_eq!(cleaned, vec!["edge ocr", "rag eval"]);
    }

    #[test]
    fn test_merge_terms_skips_duplicates() {
        let mut terms = vec!["rag".to_string()];
        merge_terms(&mut terms, &["rag", "genai"]);
        assert_eq!(terms, vec!["rag", "genai"]);
    }
}
