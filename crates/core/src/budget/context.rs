use super::{allocate, Aggressiveness, BudgetLimits, ContextBudgeter, Fitted};
use crate::pipeline::state::PipelineState;

const DOCUMENT_WEIGHT: usize = 3;
const LINK_WEIGHT: usize = 2;
const SEARCH_WEIGHT: usize = 1;

impl ContextBudgeter {
    /// Tokens of the fields that are never trimmed
    pub fn fixed_tokens(&self, state: &PipelineState) -> usize {
        self.count(state.instruction())
            + self.count(&state.keywords().join(" "))
            + self.count(&state.domains().join(" "))
    }

    fn pool_tokens(&self, state: &PipelineState) -> [usize; 3] {
        [
            state.documents.iter().map(|d| self.count(&d.text)).sum(),
            state
                .links_data
                .iter()
                .map(|l| self.count(&l.prompt_text()))
                .sum(),
            state
                .web_search_results
                .iter()
                .map(|r| self.count(&r.prompt_text()))
                .sum(),
        ]
    }

    /// Total prompt material in `state`, as the model will count it
    pub fn measure(&self, state: &PipelineState) -> usize {
        self.fixed_tokens(state) + self.pool_tokens(state).iter().sum::<usize>()
    }

    /// Produce a copy of `state` whose prompt material fits `limits`
    ///
    /// Never fails: when the budget cannot be met the most trimmed copy is
    /// returned and [`Fitted::within_budget`] is false.
    pub fn fit(&self, state: &PipelineState, limits: &BudgetLimits) -> Fitted<PipelineState> {
        let limit = limits.limit();
        let initial = self.measure(state);
        if initial <= limit {
            return Fitted {
                value: state.clone(),
                tokens: initial,
                limit,
                passes: 0,
            };
        }

        let mut base = state.clone();
        let mut fixed = self.fixed_tokens(&base);
        if fixed >= limit {
            tracing::warn!(
                session = %state.session_key,
                fixed,
                limit,
                "instruction and keywords exceed the budget, truncating instruction"
            );
            if let Some(prompt) = base.custom_prompt.as_mut() {
                *prompt = prompt
                    .split_whitespace()
                    .take(limit / 2)
                    .collect::<Vec<_>>()
                    .join(" ");
            }
            fixed = self.fixed_tokens(&base);
        }
        let remaining = limit.saturating_sub(fixed);

        let mut best = None;
        for pass in 0..limits.max_passes {
            let candidate = self.trim_pools(&base, remaining, Aggressiveness::for_pass(pass));
            let tokens = self.measure(&candidate);
            tracing::debug!(session = %state.session_key, pass = pass + 1, tokens, limit, "budget pass");

            if tokens <= limit {
                return Fitted {
                    value: candidate,
                    tokens,
                    limit,
                    passes: pass + 1,
                };
            }
            best = Some(candidate);
        }

        let value = best.unwrap_or(base);
        let tokens = self.measure(&value);
        tracing::warn!(
            session = %state.session_key,
            tokens,
            limit,
            passes = limits.max_passes,
            "context budget not met, proceeding over the limit"
        );
        Fitted {
            value,
            tokens,
            limit,
            passes: limits.max_passes,
        }
    }

    fn trim_pools(
        &self,
        state: &PipelineState,
        remaining: usize,
        aggr: Aggressiveness,
    ) -> PipelineState {
        let [docs, links, search] = self.pool_tokens(state);
        let budgets = allocate(
            remaining,
            [
                (docs, DOCUMENT_WEIGHT),
                (links, LINK_WEIGHT),
                (search, SEARCH_WEIGHT),
            ],
        );
        let per_item = |pool_budget: usize, items: usize| -> usize {
            let kept = (pool_budget as f64 * aggr.keep_fraction) as usize;
            (kept / items.max(1)).max(1)
        };

        let mut out = state.clone();

        let doc_share = per_item(budgets[0], out.documents.len());
        for doc in &mut out.documents {
            doc.text = self.trim(&doc.text, doc_share, aggr.head_fraction);
        }

        let link_share = per_item(budgets[1], out.links_data.len());
        for link in &mut out.links_data {
            if self.count(&link.prompt_text()) <= link_share {
                continue;
            }
            let frame = self.count(&link.title) + self.count(&link.url);
            let content_budget = link_share.saturating_sub(frame).max(1);
            link.content = self.trim(&link.content, content_budget, aggr.head_fraction);
        }

        let search_share = per_item(budgets[2], out.web_search_results.len());
        for result in &mut out.web_search_results {
            if self.count(&result.prompt_text()) <= search_share {
                continue;
            }
            // The synthesized answer goes first; hits carry the sources
            result.answer = None;
            let frame = self.count(&format!("Query: {} |", result.query));
            let hits = result.results.len().max(1);
            let hit_budget = (search_share.saturating_sub(frame) / hits).max(1);
            for hit in &mut result.results {
                hit.content = self.trim(&hit.content, hit_budget, aggr.head_fraction);
            }
        }

        out
    }
}
