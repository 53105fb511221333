//! # Context Budgeter
//!
//! Deterministic trimming of prompt material to fit a model's context
//! window before a call is issued. The canonical [`PipelineState`] is never
//! modified; every fit works on a copy.
//!
//! ## Algorithm
//!
//! ```text
//! limit = max_tokens - reserved
//! fits already? ──yes──▶ return unchanged
//!      │no
//! fixed fields (instruction, keywords, domains) over limit? ──▶ truncate instruction
//!      │
//! for pass in 0..max_passes:
//!     split remaining budget 3:2:1 over non-empty pools (documents, links, search)
//!     shrink each pool by keep_fraction(pass), share equally per item
//!     trim each item to head + " ... " + tail, head share = head_fraction(pass)
//!     fits? ──yes──▶ return
//! return best effort and warn (soft limit)
//! ```
//!
//! Every pass trims from the original text, so the result depends only on
//! the input and the pass count.
//!
//! [`PipelineState`]: crate::pipeline::state::PipelineState

mod context;
mod references;

use std::sync::Arc;

use crate::error::BudgetError;
use crate::llm::tokenizer::Tokenizer;

/// Marker left where the middle of a text was removed
pub const ELISION: &str = "...";

/// Texts shorter than this (in words) are cut at the end instead of elided
const MIN_ELIDE_WORDS: usize = 10;

const HEAD_START: f64 = 0.7;
const HEAD_FLOOR: f64 = 0.3;
const KEEP_FLOOR: f64 = 0.1;
const STEP: f64 = 0.1;

/// Token limits for one outgoing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    pub max_tokens: usize,
    /// Space kept free for the prompt template and the answer
    pub reserved: usize,
    pub max_passes: usize,
}

impl BudgetLimits {
    pub fn new(max_tokens: usize, reserved: usize, max_passes: usize) -> Result<Self, BudgetError> {
        if max_tokens <= reserved {
            return Err(BudgetError::NoRoom {
                max_tokens,
                reserved,
            });
        }
        Ok(Self {
            max_tokens,
            reserved,
            max_passes: max_passes.max(1),
        })
    }

    /// Tokens available to the trimmed material
    pub fn limit(&self) -> usize {
        self.max_tokens - self.reserved
    }
}

/// A trimmed value plus how it measured
#[derive(Debug, Clone, PartialEq)]
pub struct Fitted<T> {
    pub value: T,
    pub tokens: usize,
    pub limit: usize,
    /// Trimming passes run; 0 when the input already fit
    pub passes: usize,
}

impl<T> Fitted<T> {
    pub fn within_budget(&self) -> bool {
        self.tokens <= self.limit
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Trimming strength of one pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggressiveness {
    /// Share of the kept words taken from the start of a text
    pub head_fraction: f64,
    /// Share of the allocated budget actually used
    pub keep_fraction: f64,
}

impl Aggressiveness {
    pub fn for_pass(pass: usize) -> Self {
        let step = STEP * pass as f64;
        Self {
            head_fraction: (HEAD_START - step).max(HEAD_FLOOR),
            keep_fraction: (1.0 - step).max(KEEP_FLOOR),
        }
    }

    /// Head share has reached its floor
    pub fn bottomed_out(&self) -> bool {
        self.head_fraction <= HEAD_FLOOR + f64::EPSILON
    }
}

/// Measures and trims text with the transport's tokenizer
#[derive(Clone)]
pub struct ContextBudgeter {
    tokenizer: Arc<dyn Tokenizer>,
}

impl ContextBudgeter {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    pub fn count(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    /// Shrink `text` to about `budget` tokens, keeping its start and end
    pub fn trim(&self, text: &str, budget: usize, head_fraction: f64) -> String {
        let tokens = self.count(text);
        if tokens <= budget {
            return text.to_string();
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        // Words are cut, tokens are counted; scale by this text's own ratio
        let word_budget = (budget as u128 * words.len() as u128 / tokens as u128) as usize;

        if words.len() < MIN_ELIDE_WORDS || word_budget < 3 {
            let keep = word_budget.clamp(1, words.len().max(1));
            return words.iter().take(keep).copied().collect::<Vec<_>>().join(" ");
        }

        let keep = word_budget - 1;
        let head = (keep as f64 * head_fraction) as usize;
        let tail = (keep - head).max(1);

        let mut out: Vec<&str> = Vec::with_capacity(head + tail + 1);
        out.extend_from_slice(&words[..head]);
        out.push(ELISION);
        out.extend_from_slice(&words[words.len() - tail..]);
        out.join(" ")
    }
}

/// Split `budget` across pools by weight, skipping empty pools
fn allocate<const N: usize>(budget: usize, pools: [(usize, usize); N]) -> [usize; N] {
    let active: usize = pools
        .iter()
        .filter(|(tokens, _)| *tokens > 0)
        .map(|(_, weight)| weight)
        .sum();

    pools.map(|(tokens, weight)| {
        if tokens == 0 || active == 0 {
            0
        } else {
            budget * weight / active
        }
    })
}
