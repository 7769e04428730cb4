//! Classification strategies.
//!
//! The strategy set is the closed `StrategyKind` enum. Every variant shares one `classify`
//! contract and either produces a candidate or abstains. No strategy ever returns
//! a code missing from the requested taxonomy's tree.

use crate::config::ClassificationConfig;
use crate::error::{CoreError, CoreResult};
use crate::orchestrator::WorkerOrchestrator;
use crate::similarity::SimilarityEngine;
use crate::store::EntityStore;
use crate::taxonomy::TaxonomyTree;
use crate::types::{EntityRecord, StrategyKind, TaskId, Taxonomy, WorkerRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub code: String,
    pub label: String,
    pub confidence: f64,
    pub strategy: StrategyKind,
}

/// Confirmed `(taxonomy, cleaned name) -> code` mappings
#[derive(Default)]
pub struct ExactMatchCache {
    entries: RwLock<HashMap<(Taxonomy, String), (String, TaskId)>>,
}

impl ExactMatchCache {
    pub fn lookup(&self, taxonomy: Taxonomy, name: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(taxonomy, name.to_string()))
            .map(|(code, _)| code.clone())
    }

    pub fn remember(&self, taxonomy: Taxonomy, name: &str, code: &str, task_id: TaskId) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((taxonomy, name.to_string()), (code.to_string(), task_id));
    }

    /// Drop the mapping for `name` if it points at `code`
    pub fn forget(&self, taxonomy: Taxonomy, name: &str, code: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = (taxonomy, name.to_string());
        match entries.get(&key) {
            Some((cached, _)) if cached == code => {
                entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct PatternRule {
    pub pattern: Regex,
    pub taxonomy: Taxonomy,
    pub code: String,
    pub confidence: f64,
}

impl PatternRule {
    pub fn new(pattern: &str, taxonomy: Taxonomy, code: &str, confidence: f64) -> CoreResult<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            CoreError::InvalidInput(format!("bad rule pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            pattern,
            taxonomy,
            code: code.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

static BUILTIN_RULES: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    let specs: &[(&str, &str, &str, f64)] = &[
        (r"^(болт|винт)\b", "25.94.11", "25.94", 0.8),
        (r"^гайк", "25.94.12", "25.94", 0.8),
        (r"^шайб", "25.94.13", "25.94", 0.8),
        (r"\b(кабел|провод)", "27.32.1", "27.32", 0.7),
        (r"\b(электродвигател|двигатель электрическ)", "27.11.1", "27.11", 0.65),
    ];
    let mut rules = Vec::new();
    for (pattern, hierarchical, legacy, confidence) in specs {
        for (taxonomy, code) in [
            (Taxonomy::HierarchicalTree, *hierarchical),
            (Taxonomy::LegacyCodeTree, *legacy),
        ] {
            match PatternRule::new(pattern, taxonomy, code, *confidence) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("Skipping builtin rule: {}", e),
            }
        }
    }
    rules
});

pub fn builtin_rules() -> Vec<PatternRule> {
    BUILTIN_RULES.clone()
}

/// Collaborators shared by every strategy
pub struct StrategyDeps {
    pub config: ClassificationConfig,
    pub cache: ExactMatchCache,
    pub rules: Vec<PatternRule>,
    pub orchestrator: Arc<WorkerOrchestrator>,
    pub similarity: Arc<SimilarityEngine>,
    pub store: Arc<dyn EntityStore>,
}

/// Inputs for one classification run. The AI answer is fetched at most once per run
/// and shared by the AI-assisted and hybrid strategies.
pub struct ClassifyContext<'a> {
    pub entity: &'a EntityRecord,
    pub name: &'a str,
    pub taxonomy: Taxonomy,
    pub tree: &'a TaxonomyTree,
    ai_answer: OnceCell<Option<Candidate>>,
}

impl<'a> ClassifyContext<'a> {
    pub fn new(
        entity: &'a EntityRecord,
        name: &'a str,
        taxonomy: Taxonomy,
        tree: &'a TaxonomyTree,
    ) -> Self {
        Self {
            entity,
            name,
            taxonomy,
            tree,
            ai_answer: OnceCell::new(),
        }
    }
}

impl StrategyKind {
    /// Produce a candidate or abstain. Only storage failures are errors.
    pub async fn classify(
        &self,
        ctx: &ClassifyContext<'_>,
        deps: &StrategyDeps,
    ) -> CoreResult<Option<Candidate>> {
        match self {
            StrategyKind::ExactMatch => Ok(exact_match(ctx, deps)),
            StrategyKind::PatternRule => Ok(pattern_rule(ctx, deps)),
            StrategyKind::AiAssisted => Ok(ai_answer(ctx, deps).await),
            StrategyKind::Hybrid => hybrid(ctx, deps).await,
        }
    }
}

fn candidate(tree: &TaxonomyTree, code: &str, confidence: f64, strategy: StrategyKind) -> Option<Candidate> {
    let node = tree.node(code)?;
    Some(Candidate {
        code: node.code.clone(),
        label: node.label.clone(),
        confidence: confidence.clamp(0.0, 1.0),
        strategy,
    })
}

fn exact_match(ctx: &ClassifyContext<'_>, deps: &StrategyDeps) -> Option<Candidate> {
    let code = deps.cache.lookup(ctx.taxonomy, ctx.name)?;
    candidate(ctx.tree, &code, 1.0, StrategyKind::ExactMatch)
}

/// Highest-confidence matching rule; earlier rules win ties
fn pattern_rule(ctx: &ClassifyContext<'_>, deps: &StrategyDeps) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;
    for rule in deps.rules.iter().filter(|r| r.taxonomy == ctx.taxonomy) {
        if !rule.pattern.is_match(ctx.name) {
            continue;
        }
        let Some(c) = candidate(ctx.tree, &rule.code, rule.confidence, StrategyKind::PatternRule)
        else {
            continue;
        };
        if best.as_ref().map_or(true, |b| c.confidence > b.confidence) {
            best = Some(c);
        }
    }
    best
}

fn ai_request(ctx: &ClassifyContext<'_>) -> WorkerRequest {
    let mut context = vec![format!("taxonomy={}", ctx.taxonomy)];
    if let Some(category) = &ctx.entity.category {
        context.push(format!("category={}", category));
    }
    for (taxonomy, code) in &ctx.entity.assignments {
        context.push(format!("assigned {}={}", taxonomy, code));
    }
    WorkerRequest::classification(ctx.name, context)
}

async fn ai_answer(ctx: &ClassifyContext<'_>, deps: &StrategyDeps) -> Option<Candidate> {
    ctx.ai_answer
        .get_or_init(|| async {
            let response = match deps
                .orchestrator
                .execute(ai_request(ctx), deps.config.ai_timeout)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!("AI classification for '{}' abstains: {}", ctx.name, e);
                    return None;
                }
            };
            let Some(node) = ctx.tree.find_code_in(&response.label) else {
                debug!(
                    "Provider {} suggested no known {} code in '{}'",
                    response.provider, ctx.taxonomy, response.label
                );
                return None;
            };
            candidate(
                ctx.tree,
                &node.code,
                response.confidence.unwrap_or(0.0),
                StrategyKind::AiAssisted,
            )
        })
        .await
        .clone()
}

/// AI answer checked against siblings already filed under the suggested code
async fn hybrid(ctx: &ClassifyContext<'_>, deps: &StrategyDeps) -> CoreResult<Option<Candidate>> {
    let Some(mut found) = ai_answer(ctx, deps).await else {
        return Ok(None);
    };
    found.strategy = StrategyKind::Hybrid;

    let siblings = deps
        .store
        .entities_by_code(ctx.taxonomy, &found.code, deps.config.max_siblings)
        .await?;

    let mut probe = ctx.entity.clone();
    probe.name = ctx.name.to_string();
    let agreement = siblings
        .iter()
        .filter(|s| s.id != ctx.entity.id)
        .map(|s| deps.similarity.score(&probe, s))
        .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))));

    match agreement {
        None => debug!("No siblings under {}, hybrid keeps AI confidence", found.code),
        Some(score) if score >= deps.config.hybrid_agreement_threshold => {
            found.confidence = (found.confidence + deps.config.hybrid_boost).min(1.0);
        }
        Some(_) => {
            found.confidence = (found.confidence - deps.config.hybrid_penalty).max(0.0);
        }
    }
    Ok(Some(found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrchestratorConfig, SimilarityConfig};
    use crate::orchestrator::ProviderRegistration;
    use crate::providers::ScriptedProvider;
    use crate::store::InMemoryEntityStore;
    use std::time::Duration;

    fn deps(provider: Arc<ScriptedProvider>, store: InMemoryEntityStore) -> StrategyDeps {
        StrategyDeps {
            config: ClassificationConfig::default(),
            cache: ExactMatchCache::default(),
            rules: builtin_rules(),
            orchestrator: WorkerOrchestrator::start(
                "classification",
                OrchestratorConfig::default(),
                vec![ProviderRegistration::new(provider, Duration::ZERO)],
            ),
            similarity: Arc::new(SimilarityEngine::new(SimilarityConfig::default())),
            store: Arc::new(store),
        }
    }

    #[tokio::test]
    async fn test_exact_match_requires_code_in_tree() {
        let provider = Arc::new(ScriptedProvider::echo("p"));
        let d = deps(provider, InMemoryEntityStore::new());
        let tree = TaxonomyTree::builtin(Taxonomy::HierarchicalTree);
        let entity = EntityRecord::new(1, "болт м10");
        let ctx = ClassifyContext::new(&entity, "болт м10", Taxonomy::HierarchicalTree, &tree);

        d.cache.remember(Taxonomy::HierarchicalTree, "болт м10", "99.99", 1);
        assert_eq!(StrategyKind::ExactMatch.classify(&ctx, &d).await.unwrap(), None);

        d.cache.remember(Taxonomy::HierarchicalTree, "болт м10", "25.94.11", 2);
        let c = StrategyKind::ExactMatch.classify(&ctx, &d).await.unwrap().unwrap();
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.code, "25.94.11");
    }

    #[tokio::test]
    async fn test_pattern_rules_per_taxonomy() {
        let d = deps(Arc::new(ScriptedProvider::echo("p")), InMemoryEntityStore::new());
        let entity = EntityRecord::new(1, "x");
        let legacy = TaxonomyTree::builtin(Taxonomy::LegacyCodeTree);
        let ctx = ClassifyContext::new(&entity, "гайка м8", Taxonomy::LegacyCodeTree, &legacy);

        let c = StrategyKind::PatternRule.classify(&ctx, &d).await.unwrap().unwrap();
        assert_eq!(c.code, "25.94");
        assert_eq!(c.confidence, 0.8);
    }

    #[tokio::test]
    async fn test_ai_answer_is_fetched_once_per_context() {
        let provider = Arc::new(ScriptedProvider::answering("p", "25.94.12", 0.6));
        let d = deps(provider.clone(), InMemoryEntityStore::new());
        let tree = TaxonomyTree::builtin(Taxonomy::HierarchicalTree);
        let entity = EntityRecord::new(1, "x");
        let ctx = ClassifyContext::new(&entity, "гайка м8", Taxonomy::HierarchicalTree, &tree);

        let ai = StrategyKind::AiAssisted.classify(&ctx, &d).await.unwrap().unwrap();
        let hybrid = StrategyKind::Hybrid.classify(&ctx, &d).await.unwrap().unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(ai.confidence, 0.6);
        assert_eq!(hybrid.strategy, StrategyKind::Hybrid);
        // No siblings: confidence unchanged
        assert_eq!(hybrid.confidence, 0.6);
    }

    #[tokio::test]
    async fn test_hybrid_boosts_on_agreeing_siblings() {
        let store = InMemoryEntityStore::with_entities(vec![
            EntityRecord::new(7, "Гайка М8 оцинкованная")
                .with_assignment(Taxonomy::HierarchicalTree, "25.94.12"),
        ]);
        let d = deps(Arc::new(ScriptedProvider::answering("p", "код 25.94.12", 0.6)), store);
        let tree = TaxonomyTree::builtin(Taxonomy::HierarchicalTree);
        let entity = EntityRecord::new(1, "x");
        let ctx = ClassifyContext::new(&entity, "гайка м8 оцинкованная", Taxonomy::HierarchicalTree, &tree);

        let c = StrategyKind::Hybrid.classify(&ctx, &d).await.unwrap().unwrap();
        assert!((c.confidence - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ai_abstains_on_provider_failure_and_unknown_code() {
        use crate::providers::ProviderFailure;
        let d = deps(
            Arc::new(ScriptedProvider::failing("p", ProviderFailure::Auth("401".into()))),
            InMemoryEntityStore::new(),
        );
        let tree = TaxonomyTree::builtin(Taxonomy::HierarchicalTree);
        let entity = EntityRecord::new(1, "x");
        let ctx = ClassifyContext::new(&entity, "гайка", Taxonomy::HierarchicalTree, &tree);
        assert_eq!(StrategyKind::AiAssisted.classify(&ctx, &d).await.unwrap(), None);

        let d = deps(Arc::new(ScriptedProvider::answering("p", "99.99", 0.9)), InMemoryEntityStore::new());
        let ctx = ClassifyContext::new(&entity, "гайка", Taxonomy::HierarchicalTree, &tree);
        assert_eq!(StrategyKind::AiAssisted.classify(&ctx, &d).await.unwrap(), None);
    }

    #[test]
    fn test_cache_forget_only_matching_code() {
        let cache = ExactMatchCache::default();
        cache.remember(Taxonomy::LegacyCodeTree, "болт", "25.94", 1);
        assert!(!cache.forget(Taxonomy::LegacyCodeTree, "болт", "27.32"));
        assert!(cache.forget(Taxonomy::LegacyCodeTree, "болт", "25.94"));
        assert!(cache.is_empty());
    }
}
