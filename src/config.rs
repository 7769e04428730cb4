//! Runtime configuration with defaults and `CATNORM_*` environment overrides

use crate::error::{CoreError, CoreResult};
use crate::types::{StrategyKind, Taxonomy};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub orchestrator: OrchestratorConfig,
    pub classification: ClassificationConfig,
    pub similarity: SimilarityConfig,
    pub duplicates: DuplicateConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Retries within one provider for transient errors
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub base_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    /// Providers above this failure rate are skipped
    pub failure_rate_ceiling: f64,
    pub min_samples_for_health: u64,
    /// Recent outcomes the failure rate is computed over
    pub health_window: usize,
    /// Quiet time after which a skipped provider gets one trial call
    #[serde(with = "millis")]
    pub health_cooldown: Duration,
    /// Upper bound for one task, rate-limit waits included
    #[serde(with = "millis")]
    pub task_timeout: Duration,
    /// Interval at which long-running provider calls poll the pool state
    #[serde(with = "millis")]
    pub stop_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            max_retries: 2,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            failure_rate_ceiling: 0.8,
            min_samples_for_health: 10,
            health_window: 20,
            health_cooldown: Duration::from_secs(30),
            task_timeout: Duration::from_secs(60),
            stop_poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub acceptance_thresholds: HashMap<Taxonomy, f64>,
    /// Strategies in the order they are tried; also the tie-break order
    pub priority: Vec<StrategyKind>,
    #[serde(with = "millis")]
    pub ai_timeout: Duration,
    /// Sibling similarity at or above which hybrid boosts the AI confidence
    pub hybrid_agreement_threshold: f64,
    pub hybrid_boost: f64,
    pub hybrid_penalty: f64,
    pub max_siblings: usize,
}

impl ClassificationConfig {
    pub const DEFAULT_THRESHOLD: f64 = 0.7;

    pub fn threshold(&self, taxonomy: Taxonomy) -> f64 {
        self.acceptance_thresholds
            .get(&taxonomy)
            .copied()
            .unwrap_or(Self::DEFAULT_THRESHOLD)
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            acceptance_thresholds: Taxonomy::ALL
                .iter()
                .map(|t| (*t, Self::DEFAULT_THRESHOLD))
                .collect(),
            priority: vec![
                StrategyKind::ExactMatch,
                StrategyKind::PatternRule,
                StrategyKind::Hybrid,
                StrategyKind::AiAssisted,
            ],
            ai_timeout: Duration::from_secs(30),
            hybrid_agreement_threshold: 0.75,
            hybrid_boost: 0.15,
            hybrid_penalty: 0.2,
            max_siblings: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub cache_capacity: usize,
    /// Coordinate search step over weight space
    pub learning_step: f64,
    pub learning_rounds: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 100_000,
            learning_step: 0.1,
            learning_rounds: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DuplicateConfig {
    pub threshold: f64,
    pub max_candidates: usize,
    /// Length of the name prefix used as blocking key by `find_similar`
    pub blocking_prefix_len: usize,
    /// Upper bound on records fetched per prefix query
    pub prefix_scan_limit: usize,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            max_candidates: 20,
            blocking_prefix_len: 4,
            prefix_scan_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    #[serde(with = "millis")]
    pub ai_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ai_timeout: Duration::from_secs(60),
        }
    }
}

/// Provider endpoint parsed from `CATNORM_PROVIDERS`
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEndpoint {
    pub name: String,
    pub url: String,
    pub min_interval: Duration,
    pub api_key: Option<String>,
}

impl CoreConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> CoreResult<Self> {
        let mut cfg = Self::default();
        let o = &mut cfg.orchestrator;
        override_from_env("CATNORM_WORKERS", &mut o.workers)?;
        override_from_env("CATNORM_QUEUE_CAPACITY", &mut o.queue_capacity)?;
        override_from_env("CATNORM_MAX_RETRIES", &mut o.max_retries)?;
        override_millis_from_env("CATNORM_BASE_BACKOFF_MS", &mut o.base_backoff)?;
        override_millis_from_env("CATNORM_MAX_BACKOFF_MS", &mut o.max_backoff)?;
        override_from_env("CATNORM_FAILURE_RATE_CEILING", &mut o.failure_rate_ceiling)?;
        override_millis_from_env("CATNORM_HEALTH_COOLDOWN_MS", &mut o.health_cooldown)?;
        override_millis_from_env("CATNORM_TASK_TIMEOUT_MS", &mut o.task_timeout)?;

        let mut legacy = cfg.classification.threshold(Taxonomy::LegacyCodeTree);
        let mut hierarchical = cfg.classification.threshold(Taxonomy::HierarchicalTree);
        override_from_env("CATNORM_LEGACY_THRESHOLD", &mut legacy)?;
        override_from_env("CATNORM_HIERARCHICAL_THRESHOLD", &mut hierarchical)?;
        cfg.classification
            .acceptance_thresholds
            .insert(Taxonomy::LegacyCodeTree, legacy);
        cfg.classification
            .acceptance_thresholds
            .insert(Taxonomy::HierarchicalTree, hierarchical);

        override_from_env("CATNORM_DUPLICATE_THRESHOLD", &mut cfg.duplicates.threshold)?;
        override_millis_from_env("CATNORM_PIPELINE_AI_TIMEOUT_MS", &mut cfg.pipeline.ai_timeout)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.orchestrator.workers == 0 {
            return Err(CoreError::InvalidInput("workers must be positive".into()));
        }
        if self.orchestrator.queue_capacity == 0 {
            return Err(CoreError::InvalidInput("queue capacity must be positive".into()));
        }
        if (self.orchestrator.health_window as u64) < self.orchestrator.min_samples_for_health {
            return Err(CoreError::InvalidInput(
                "health window is smaller than the minimum health sample count".into(),
            ));
        }
        check_unit("failure_rate_ceiling", self.orchestrator.failure_rate_ceiling)?;
        for (taxonomy, t) in &self.classification.acceptance_thresholds {
            check_unit(&format!("{} threshold", taxonomy), *t)?;
        }
        check_unit("duplicate threshold", self.duplicates.threshold)?;
        if self.classification.priority.is_empty() {
            return Err(CoreError::InvalidInput("strategy priority list is empty".into()));
        }
        Ok(())
    }
}

/// Parse `name=url[@min_interval_ms]` entries separated by commas.
/// API keys come from `CATNORM_<NAME>_API_KEY`.
pub fn providers_from_env() -> CoreResult<Vec<ProviderEndpoint>> {
    let raw = match std::env::var("CATNORM_PROVIDERS") {
        Ok(v) => v,
        Err(_) => return Ok(Vec::new()),
    };
    parse_providers(&raw, |name| {
        std::env::var(format!("CATNORM_{}_API_KEY", name.to_uppercase())).ok()
    })
}

pub fn parse_providers(
    raw: &str,
    api_key: impl Fn(&str) -> Option<String>,
) -> CoreResult<Vec<ProviderEndpoint>> {
    let mut endpoints = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, rest) = entry
            .split_once('=')
            .ok_or_else(|| CoreError::InvalidInput(format!("provider entry '{}' lacks '='", entry)))?;
        let (url, interval) = match rest.rsplit_once('@') {
            Some((url, ms)) => {
                let ms: u64 = ms.parse().map_err(|_| {
                    CoreError::InvalidInput(format!("bad interval in provider entry '{}'", entry))
                })?;
                (url, Duration::from_millis(ms))
            }
            None => (rest, Duration::ZERO),
        };
        let name = name.trim().to_string();
        endpoints.push(ProviderEndpoint {
            api_key: api_key(&name),
            name,
            url: url.trim().to_string(),
            min_interval: interval,
        });
    }
    Ok(endpoints)
}

fn check_unit(what: &str, value: f64) -> CoreResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!("{} must be within [0, 1], got {}", what, value)))
    }
}

fn override_from_env<T: FromStr>(key: &str, slot: &mut T) -> CoreResult<()> {
    if let Ok(raw) = std::env::var(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| CoreError::InvalidInput(format!("cannot parse {}='{}'", key, raw)))?;
    }
    Ok(())
}

fn override_millis_from_env(key: &str, slot: &mut Duration) -> CoreResult<()> {
    let mut ms = slot.as_millis() as u64;
    override_from_env(key, &mut ms)?;
    *slot = Duration::from_millis(ms);
    Ok(())
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
