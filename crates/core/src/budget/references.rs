use super::{Aggressiveness, BudgetLimits, ContextBudgeter, Fitted};
use crate::tools::references::Reference;

impl ContextBudgeter {
    fn reference_tokens(&self, reference: &Reference) -> usize {
        self.count(&reference.title) + self.count(&reference.tag) + self.count(&reference.description)
    }

    fn total_reference_tokens(&self, references: &[Reference]) -> usize {
        references.iter().map(|r| self.reference_tokens(r)).sum()
    }

    /// Fit a reference list for the ranking prompt
    ///
    /// Descriptions are elided first; once trimming bottoms out (or passes
    /// run out) entries are dropped from the end, which holds the least
    /// prioritized sources.
    pub fn fit_references(
        &self,
        references: &[Reference],
        limits: &BudgetLimits,
    ) -> Fitted<Vec<Reference>> {
        let limit = limits.limit();
        let initial = self.total_reference_tokens(references);
        if initial <= limit || references.is_empty() {
            return Fitted {
                value: references.to_vec(),
                tokens: initial,
                limit,
                passes: 0,
            };
        }

        for pass in 0..limits.max_passes {
            let aggr = Aggressiveness::for_pass(pass);
            let share = ((limit as f64 * aggr.keep_fraction) as usize / references.len()).max(1);

            let mut candidate: Vec<Reference> = references
                .iter()
                .map(|r| {
                    let frame = self.count(&r.title) + self.count(&r.tag);
                    Reference {
                        description: self.trim(
                            &r.description,
                            share.saturating_sub(frame).max(1),
                            aggr.head_fraction,
                        ),
                        ..r.clone()
                    }
                })
                .collect();
            let mut tokens = self.total_reference_tokens(&candidate);

            let last_pass = pass + 1 == limits.max_passes;
            if tokens > limit && (aggr.bottomed_out() || last_pass) {
                while tokens > limit {
                    let Some(dropped) = candidate.pop() else {
                        break;
                    };
                    tokens -= self.reference_tokens(&dropped);
                }
                tracing::debug!(
                    kept = candidate.len(),
                    total = references.len(),
                    "dropped references to fit the budget"
                );
            }

            if tokens <= limit {
                return Fitted {
                    value: candidate,
                    tokens,
                    limit,
                    passes: pass + 1,
                };
            }
        }

        // Only reached with max_passes == 0; the final pass always truncates to fit
        Fitted {
            value: Vec::new(),
            tokens: 0,
            limit,
            passes: limits.max_passes,
        }
    }
}
