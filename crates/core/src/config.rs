//! # Pipeline Configuration
//!
//! Everything a workflow run can be tuned with: which model serves which
//! prompt, feature switches, token budgets and timeouts.
//!
//! Sources, later ones winning:
//! 1. [`PipelineConfig::default`]
//! 2. a JSON file ([`PipelineConfig::load`], or `WORKLET_CONFIG` in [`PipelineConfig::from_env`])
//! 3. `WORKLET_*` environment variables

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::budget::BudgetLimits;
use crate::llm::retry::{RetryPolicy, MODEL_ATTEMPTS};
use crate::models::{ModelConfig, DEFAULT_MODEL, PRIMARY_PORT, SECONDARY_PORT};

/// Which model serves each prompt kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRoster {
    pub keyword_extraction: ModelConfig,
    pub query_planning: ModelConfig,
    pub generation: ModelConfig,
    /// Rotated by worklet index
    pub reference_keywords: Vec<ModelConfig>,
    /// Rotated by worklet index
    pub reference_ranking: Vec<ModelConfig>,
}

impl Default for ModelRoster {
    fn default() -> Self {
        let primary = ModelConfig::new(DEFAULT_MODEL, PRIMARY_PORT);
        let secondary = ModelConfig::new(DEFAULT_MODEL, SECONDARY_PORT);
        Self {
            keyword_extraction: primary.clone(),
            query_planning: secondary.clone(),
            generation: primary.clone(),
            reference_keywords: vec![primary.clone(), secondary.clone()],
            reference_ranking: vec![primary, secondary],
        }
    }
}

impl ModelRoster {
    fn entries_mut(&mut self) -> impl Iterator<Item = &mut ModelConfig> {
        [
            &mut self.keyword_extraction,
            &mut self.query_planning,
            &mut self.generation,
        ]
        .into_iter()
        .chain(self.reference_keywords.iter_mut())
        .chain(self.reference_ranking.iter_mut())
    }
}

/// Optional stages and model calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Switches {
    /// Ask the model for keywords/domains; otherwise only cluster terms are offered
    pub extract_keywords_domains: bool,
    /// Ask the model for per-provider reference keywords; otherwise use the title
    pub generate_reference_keywords: bool,
    pub rank_references: bool,
}

impl Default for Switches {
    fn default() -> Self {
        Self {
            extract_keywords_domains: true,
            generate_reference_keywords: true,
            rank_references: true,
        }
    }
}

/// Prompt kinds with their own reserved overhead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Extraction,
    QueryPlanning,
    Generation,
    Ranking,
}

/// Tokens kept free per prompt kind for the template and the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservedOverheads {
    pub extraction: usize,
    pub query_planning: usize,
    pub generation: usize,
    pub ranking: usize,
}

impl Default for ReservedOverheads {
    fn default() -> Self {
        Self {
            extraction: 600,
            query_planning: 900,
            generation: 1_100,
            ranking: 400,
        }
    }
}

impl ReservedOverheads {
    pub fn for_kind(&self, kind: PromptKind) -> usize {
        match kind {
            PromptKind::Extraction => self.extraction,
            PromptKind::QueryPlanning => self.query_planning,
            PromptKind::Generation => self.generation,
            PromptKind::Ranking => self.ranking,
        }
    }
}

/// Configuration for the worklet pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub models: ModelRoster,
    pub switches: Switches,
    /// Context window of the served models
    pub max_tokens: usize,
    /// Attempts per model call
    pub max_attempts: u32,
    /// Trimming passes per budget fit
    pub budget_passes: usize,
    pub reserved: ReservedOverheads,
    pub approval_timeout_secs: u64,
    pub status_interval_ms: u64,
    /// Retry for search, extraction and reference lookups
    pub upstream_retry: RetryPolicy,
    /// Root directory for emitted worklet files
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models: ModelRoster::default(),
            switches: Switches::default(),
            max_tokens: 50_000,
            max_attempts: MODEL_ATTEMPTS,
            budget_passes: 10,
            reserved: ReservedOverheads::default(),
            approval_timeout_secs: 300,
            status_interval_ms: 500,
            upstream_retry: RetryPolicy::upstream(),
            output_dir: PathBuf::from("output"),
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Defaults (or `WORKLET_CONFIG`), then environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("WORKLET_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `WORKLET_*` overrides read through `lookup`
    ///
    /// `WORKLET_MODEL` and `WORKLET_MODEL_HOST` apply to every roster entry;
    /// the port overrides move entries on the default primary/secondary port.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = parsed::<usize>(&lookup, "WORKLET_MAX_TOKENS")? {
            self.max_tokens = v;
        }
        if let Some(v) = parsed::<u64>(&lookup, "WORKLET_APPROVAL_TIMEOUT_SECS")? {
            self.approval_timeout_secs = v;
        }
        if let Some(raw) = lookup("WORKLET_RANK_REFERENCES") {
            self.switches.rank_references = parse_flag(&raw)
                .with_context(|| format!("Invalid WORKLET_RANK_REFERENCES: {}", raw))?;
        }
        if let Some(dir) = lookup("WORKLET_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }

        let model = lookup("WORKLET_MODEL");
        let host = lookup("WORKLET_MODEL_HOST");
        let primary = parsed::<u16>(&lookup, "WORKLET_PORT_PRIMARY")?;
        let secondary = parsed::<u16>(&lookup, "WORKLET_PORT_SECONDARY")?;

        for entry in self.models.entries_mut() {
            if let Some(model) = &model {
                entry.model = model.clone();
            }
            if let Some(host) = &host {
                entry.host = host.clone();
            }
            match entry.port {
                PRIMARY_PORT => entry.port = primary.unwrap_or(PRIMARY_PORT),
                SECONDARY_PORT => entry.port = secondary.unwrap_or(SECONDARY_PORT),
                _ => {}
            }
        }
        Ok(())
    }

    /// Model for the reference-keyword call of worklet `index`
    pub fn reference_keywords_for(&self, index: usize) -> &ModelConfig {
        round_robin(&self.models.reference_keywords, index).unwrap_or(&self.models.generation)
    }

    /// Model for the ranking call of worklet `index`
    pub fn reference_ranking_for(&self, index: usize) -> &ModelConfig {
        round_robin(&self.models.reference_ranking, index).unwrap_or(&self.models.generation)
    }

    pub fn limits_for(&self, kind: PromptKind) -> Result<BudgetLimits> {
        BudgetLimits::new(self.max_tokens, self.reserved.for_kind(kind), self.budget_passes)
            .with_context(|| format!("No token budget left for {:?} prompts", kind))
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

fn round_robin(models: &[ModelConfig], index: usize) -> Option<&ModelConfig> {
    if models.is_empty() {
        None
    } else {
        models.get(index % models.len())
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {}: {}", key, raw))
        })
        .transpose()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_tokens, 50_000);
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.upstream_retry.max_attempts, 5);
        assert_eq!(config.approval_timeout(), Duration::from_secs(300));
        assert!(config.switches.rank_references);
        assert_eq!(config.models.reference_keywords.len(), 2);
        assert_eq!(
            config.limits_for(PromptKind::Generation).unwrap().limit(),
            48_900
        );
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worklet.json");
        std::fs::write(
            &path,
            r#"{"max_tokens": 8000, "switches": {"rank_references": false}}"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.max_tokens, 8_000);
        assert!(!config.switches.rank_references);
        assert!(config.switches.extract_keywords_domains);
        assert_eq!(config.reserved.ranking, 400);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_env_with(env(&[
                ("WORKLET_MAX_TOKENS", "32000"),
                ("WORKLET_RANK_REFERENCES", "off"),
                ("WORKLET_MODEL", "qwen3:8b"),
                ("WORKLET_MODEL_HOST", "gpu-1"),
                ("WORKLET_PORT_SECONDARY", "12000"),
            ]))
            .unwrap();

        assert_eq!(config.max_tokens, 32_000);
        assert!(!config.switches.rank_references);
        assert_eq!(config.models.generation.model, "qwen3:8b");
        assert_eq!(config.models.generation.host, "gpu-1");
        assert_eq!(config.models.generation.port, PRIMARY_PORT);
        assert_eq!(config.models.query_planning.port, 12_000);
        assert_eq!(config.models.reference_ranking[1].port, 12_000);
    }

    #[test]
    fn test_invalid_env_is_an_error() {
        let mut config = PipelineConfig::default();
        assert!(config
            .apply_env_with(env(&[("WORKLET_MAX_TOKENS", "lots")]))
            .is_err());
        assert!(config
            .apply_env_with(env(&[("WORKLET_RANK_REFERENCES", "maybe")]))
            .is_err());
    }

    #[test]
    fn test_round_robin_models() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.reference_keywords_for(0).port, PRIMARY_PORT);
        assert_eq!(config.reference_keywords_for(1).port, SECONDARY_PORT);
        assert_eq!(config.reference_keywords_for(2).port, PRIMARY_PORT);

        config.models.reference_ranking.clear();
        assert_eq!(config.reference_ranking_for(3), &config.models.generation);
    }

    #[test]
    fn test_reserved_must_leave_room() {
        let config = PipelineConfig {
            max_tokens: 500,
            ..Default::default()
        };
        assert!(config.limits_for(PromptKind::Extraction).is_err());
        assert!(config.limits_for(PromptKind::Ranking).is_ok());
    }
}
