//! End-to-end scenarios across pipeline, classification, worker pool and duplicates

use crate::config::{
    ClassificationConfig, DuplicateConfig, OrchestratorConfig, PipelineConfig, SimilarityConfig,
};
use crate::providers::ProviderFailure;
use crate::similarity::{Comparator, Field, FieldSpec};
use crate::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn fast_pool_config() -> OrchestratorConfig {
    OrchestratorConfig {
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        ..OrchestratorConfig::default()
    }
}

fn shared(provider: ScriptedProvider) -> Arc<dyn AiProvider> {
    Arc::new(provider)
}

fn pool(name: &str, providers: Vec<Arc<dyn AiProvider>>) -> Arc<WorkerOrchestrator> {
    WorkerOrchestrator::start(
        name,
        fast_pool_config(),
        providers
            .into_iter()
            .map(|p| ProviderRegistration::new(p, Duration::ZERO))
            .collect(),
    )
}

struct Harness {
    pipeline: NormalizationPipeline,
    classifier: Arc<ClassificationEngine>,
    correction_pool: Arc<WorkerOrchestrator>,
}

fn harness(correction: Vec<Arc<dyn AiProvider>>, classification: Arc<dyn AiProvider>) -> Harness {
    let audit = Arc::new(InMemoryAuditStore::new());
    let correction_pool = pool("correction", correction);
    let classifier = Arc::new(ClassificationEngine::new(
        ClassificationConfig::default(),
        Taxonomy::ALL.iter().map(|t| TaxonomyTree::builtin(*t)).collect(),
        pool("classification", vec![classification]),
        Arc::new(SimilarityEngine::new(SimilarityConfig::default())),
        Arc::new(InMemoryEntityStore::new()),
        audit.clone(),
    ));
    let pipeline = NormalizationPipeline::new(
        PipelineConfig::default(),
        correction_pool.clone(),
        classifier.clone(),
        audit,
    );
    Harness { pipeline, classifier, correction_pool }
}

fn echo_harness() -> Harness {
    harness(
        vec![shared(ScriptedProvider::echo("echo"))],
        Arc::new(ScriptedProvider::answering("cls", "не знаю", 0.9)),
    )
}

#[tokio::test]
async fn test_new_session_has_empty_history() {
    let h = echo_harness();
    let s = assert_ok!(h.pipeline.start_session(7, "Шайба 10"));

    let view = h.pipeline.get_session(s.id).await.unwrap();
    assert_eq!(view.status, SessionStatus::Created);
    assert_eq!(view.current_value, "Шайба 10");
    assert!(h.pipeline.get_session_history(s.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pattern_stage_is_idempotent() {
    let h = echo_harness();
    let first = h.pipeline.start_session(1, "  ГАЙКА  М8 (оцинк.) ").unwrap();
    let once = h.pipeline.apply_patterns(first.id).await.unwrap().output_value;

    let second = h.pipeline.start_session(1, &once).unwrap();
    let twice = h.pipeline.apply_patterns(second.id).await.unwrap().output_value;

    assert_eq!(once, twice);
}

#[tokio::test]
async fn test_revert_and_replay_only_grows_history() {
    let h = echo_harness();
    let s = h.pipeline.start_session(3, "Болт М12х60").unwrap();
    h.pipeline.apply_patterns(s.id).await.unwrap();
    h.pipeline.apply_ai(s.id, false).await.unwrap();
    h.pipeline.apply_categorization(s.id).await.unwrap();
    let before = h.pipeline.get_session(s.id).await.unwrap();
    assert_eq!(before.status, SessionStatus::Categorized);

    let reverted = h.pipeline.revert_stage(s.id, "ai_correction").await.unwrap();
    assert_eq!(reverted.snapshot_count, 3);
    assert_eq!(reverted.current_stage_index, 1);

    h.pipeline.apply_ai(s.id, false).await.unwrap();
    assert_eq!(h.pipeline.get_session_history(s.id).await.unwrap().len(), 4);
    h.pipeline.apply_categorization(s.id).await.unwrap();

    let after = h.pipeline.get_session(s.id).await.unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.current_value, before.current_value);
    assert_eq!(after.snapshot_count, 5);
}

#[tokio::test]
async fn test_concurrent_ai_stage_applies_once() {
    let slow = ScriptedProvider::echo("slow").with_delay(Duration::from_millis(30));
    let h = harness(
        vec![shared(slow)],
        Arc::new(ScriptedProvider::answering("cls", "не знаю", 0.9)),
    );
    let s = h.pipeline.start_session(2, "Кабель ВВГ 3х2.5").unwrap();
    h.pipeline.apply_patterns(s.id).await.unwrap();

    let (a, b) = tokio::join!(h.pipeline.apply_ai(s.id, false), h.pipeline.apply_ai(s.id, false));

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(CoreError::InvalidState(_)))));
    let ai_snapshots = h
        .pipeline
        .get_session_history(s.id)
        .await
        .unwrap()
        .iter()
        .filter(|snap| snap.stage == Stage::AiCorrection)
        .count();
    assert_eq!(ai_snapshots, 1);
}

#[tokio::test]
async fn test_revert_waits_for_in_flight_ai_stage() {
    let slow = ScriptedProvider::echo("slow").with_delay(Duration::from_millis(50));
    let h = harness(
        vec![shared(slow)],
        Arc::new(ScriptedProvider::answering("cls", "не знаю", 0.9)),
    );
    let s = h.pipeline.start_session(6, "Труба 20х2.8").unwrap();
    h.pipeline.apply_patterns(s.id).await.unwrap();

    let (ai, reverted) = tokio::join!(h.pipeline.apply_ai(s.id, false), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.pipeline.revert_stage(s.id, "patterns").await
    });

    assert!(assert_ok!(ai).success);
    let view = assert_ok!(reverted);
    assert_eq!(view.current_stage_index, 0);
    assert_eq!(view.snapshot_count, 2);
    let history = h.pipeline.get_session_history(s.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].stage, Stage::AiCorrection);
}

#[tokio::test]
async fn test_auth_failure_fails_over_and_is_counted_once() {
    let locked = Arc::new(ScriptedProvider::failing(
        "locked",
        ProviderFailure::Auth("bad key".into()),
    ));
    let h = harness(
        vec![locked.clone() as Arc<dyn AiProvider>, shared(ScriptedProvider::echo("backup"))],
        Arc::new(ScriptedProvider::answering("cls", "не знаю", 0.9)),
    );
    let s = h.pipeline.start_session(4, "Шайба 8").unwrap();
    h.pipeline.apply_patterns(s.id).await.unwrap();

    let snap = assert_ok!(h.pipeline.apply_ai(s.id, false).await);

    assert!(snap.success);
    assert_eq!(locked.calls(), 1);
    let stats = h.correction_pool.stats("locked").unwrap();
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.requests_total, 1);
    assert_eq!(h.correction_pool.stats("backup").unwrap().requests_success, 1);
}

#[tokio::test]
async fn test_all_providers_rate_limited_fails_session() {
    let h = harness(
        vec![
            shared(ScriptedProvider::failing("a", ProviderFailure::RateLimited("slow down".into()))),
            shared(ScriptedProvider::failing("b", ProviderFailure::RateLimited("slow down".into()))),
        ],
        Arc::new(ScriptedProvider::answering("cls", "не знаю", 0.9)),
    );
    let s = h.pipeline.start_session(5, "Гайка М10").unwrap();
    h.pipeline.apply_patterns(s.id).await.unwrap();

    let snap = assert_ok!(h.pipeline.apply_ai(s.id, false).await);

    assert!(!snap.success);
    assert_eq!(
        snap.error_detail.map(|d| d.category),
        Some(ErrorCategory::AllProvidersExhausted)
    );
    assert_eq!(h.pipeline.get_session(s.id).await.unwrap().status, SessionStatus::Failed);
    for name in ["a", "b"] {
        assert_eq!(h.correction_pool.stats(name).unwrap().requests_failed, 1);
    }
}

#[tokio::test]
async fn test_confirmed_mapping_short_circuits_and_rejection_clears_it() {
    let ai = Arc::new(ScriptedProvider::answering("cls", "27.32.1 кабели силовые", 0.9));
    let h = harness(vec![shared(ScriptedProvider::echo("echo"))], ai.clone());
    let name = "Изделие XYZ-1";

    let first = h
        .classifier
        .classify_name(10, name, Taxonomy::HierarchicalTree)
        .await
        .unwrap();
    assert_eq!(first.candidate_code.as_deref(), Some("27.32.1"));
    assert_eq!(ai.calls(), 1);
    h.classifier.mark_correct(first.id).await.unwrap();

    let cached = h
        .classifier
        .classify_name(11, name, Taxonomy::HierarchicalTree)
        .await
        .unwrap();
    assert_eq!(cached.strategy_used, Some(StrategyKind::ExactMatch));
    assert_eq!(cached.confidence, 1.0);
    assert_eq!(ai.calls(), 1);

    h.classifier
        .mark_incorrect(cached.id, Some("wrong branch".into()))
        .await
        .unwrap();
    assert!(h.classifier.exact_match_cache().is_empty());

    let fallback = h
        .classifier
        .classify_name(12, name, Taxonomy::HierarchicalTree)
        .await
        .unwrap();
    assert_ne!(fallback.strategy_used, Some(StrategyKind::ExactMatch));
    assert_eq!(ai.calls(), 2);
}

fn labeled_pairs() -> Vec<LabeledPair> {
    let names = [
        ("Болт М10х40", "Кабель ВВГ 3х2.5"),
        ("Гайка М8", "Электродвигатель АИР80"),
        ("Шайба 10", "Провод ПВС 2х1.5"),
        ("Винт М6х20", "Подшипник 6204"),
        ("Хомут 40-60", "Лампа LED 10Вт"),
        ("Анкер 10х100", "Перчатки рабочие"),
    ];
    let mut pairs = Vec::new();
    let mut id = 0;
    for (same, other) in names {
        id += 2;
        // Category disagrees on duplicates and agrees on distinct records
        pairs.push(LabeledPair::new(
            EntityRecord::new(id, same).with_category("склад-1"),
            EntityRecord::new(id + 1, same.to_uppercase()).with_category("склад-2"),
            true,
        ));
        id += 2;
        pairs.push(LabeledPair::new(
            EntityRecord::new(id, same).with_category("склад-1"),
            EntityRecord::new(id + 1, other).with_category("склад-1"),
            false,
        ));
    }
    pairs
}

#[test]
fn test_learned_weights_not_worse_than_uniform() {
    let engine = SimilarityEngine::new(SimilarityConfig::default());
    let report = engine.cross_validate(&labeled_pairs(), 3).unwrap();

    assert_eq!(report.folds.len(), 3);
    assert!(report.learned_mean_f1 >= report.baseline_mean_f1);
    assert_eq!(engine.current_weights().version, 0);
}

#[tokio::test]
async fn test_duplicate_groups_are_transitive() {
    let at = |id: EntityId, x: f64| EntityRecord::new(id, format!("деталь {}", id)).with_measure("x", x);
    let store = Arc::new(InMemoryEntityStore::with_entities(vec![
        at(1, 0.0),
        at(2, 2.0),
        at(3, 4.0),
        at(4, 100.0),
        at(5, 102.0),
    ]));
    let similarity = Arc::new(SimilarityEngine::with_fields(
        SimilarityConfig::default(),
        vec![FieldSpec { field: Field::Measures, comparator: Comparator::Numeric { scale: 10.0 } }],
    ));
    let detector = DuplicateDetector::new(
        DuplicateConfig { threshold: 0.75, ..DuplicateConfig::default() },
        similarity,
        store,
    );

    let groups = detector.detect_batch(&[5, 4, 3, 2, 1]).await.unwrap();

    let members: Vec<_> = groups.iter().map(|g| g.member_entity_ids.clone()).collect();
    assert_eq!(members, vec![vec![1, 2, 3], vec![4, 5]]);

    let merged = detector
        .resolve(groups[1].group_id, Resolution::Merged, Some(5))
        .unwrap();
    assert_eq!(merged.representative_id, 5);
    let again = assert_err!(detector.resolve(groups[1].group_id, Resolution::KeptSeparate, None));
    assert!(matches!(again, CoreError::InvalidState(_)));
}
