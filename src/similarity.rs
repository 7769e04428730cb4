//! Field-weighted entity similarity with learned weights.
//!
//! Each configured field has a comparator producing a score in [0, 1]. The combined score is
//! the weighted average over fields present on both records. Weights are versioned and
//! published by swapping an `Arc`, so readers always see one complete weight set.

use crate::config::SimilarityConfig;
use crate::error::{CoreError, CoreResult};
use crate::patterns;
use crate::types::{EntityId, EntityRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Exact,
    /// Mean of normalized Levenshtein and Jaro-Winkler over cleaned text
    Text,
    /// `1 - |a - b| / scale`, floored at 0. A zero scale is relative to the larger magnitude.
    Numeric { scale: f64 },
    /// Jaccard index of whitespace tokens
    TokenSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Code,
    Category,
    Attributes,
    Measures,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Code => "code",
            Field::Category => "category",
            Field::Attributes => "attributes",
            Field::Measures => "measures",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: Field,
    pub comparator: Comparator,
}

pub fn default_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec { field: Field::Name, comparator: Comparator::Text },
        FieldSpec { field: Field::Code, comparator: Comparator::Exact },
        FieldSpec { field: Field::Category, comparator: Comparator::Exact },
        FieldSpec { field: Field::Attributes, comparator: Comparator::TokenSet },
        FieldSpec { field: Field::Measures, comparator: Comparator::Numeric { scale: 0.0 } },
    ]
}

fn text_score(a: &str, b: &str) -> f64 {
    let a = patterns::clean(a);
    let b = patterns::clean(b);
    if a == b {
        return 1.0;
    }
    0.5 * strsim::normalized_levenshtein(&a, &b) + 0.5 * strsim::jaro_winkler(&a, &b)
}

fn numeric_score(a: f64, b: f64, scale: f64) -> f64 {
    let scale = if scale > 0.0 { scale } else { a.abs().max(b.abs()) };
    if scale == 0.0 {
        return 1.0;
    }
    (1.0 - (a - b).abs() / scale).max(0.0)
}

fn token_set_score(a: &str, b: &str) -> f64 {
    let ta: BTreeSet<&str> = a.split_whitespace().collect();
    let tb: BTreeSet<&str> = b.split_whitespace().collect();
    let union = ta.union(&tb).count();
    if union == 0 {
        return 1.0;
    }
    ta.intersection(&tb).count() as f64 / union as f64
}

fn compare_text(comparator: Comparator, a: &str, b: &str) -> f64 {
    match comparator {
        Comparator::Exact => f64::from(u8::from(a.trim().to_lowercase() == b.trim().to_lowercase())),
        Comparator::Text => text_score(a, b),
        Comparator::TokenSet => token_set_score(&patterns::clean(a), &patterns::clean(b)),
        Comparator::Numeric { scale } => match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
            (Ok(x), Ok(y)) => numeric_score(x, y, scale),
            _ => f64::from(u8::from(a == b)),
        },
    }
}

fn attribute_text(e: &EntityRecord) -> Option<String> {
    if e.attributes.is_empty() {
        return None;
    }
    Some(
        e.attributes
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.replace(char::is_whitespace, "_")))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

impl FieldSpec {
    /// Score for this field, `None` when either side lacks it
    pub fn score(&self, a: &EntityRecord, b: &EntityRecord) -> Option<f64> {
        match self.field {
            Field::Name => {
                if a.name.trim().is_empty() || b.name.trim().is_empty() {
                    None
                } else {
                    Some(compare_text(self.comparator, &a.name, &b.name))
                }
            }
            Field::Code => Some(compare_text(self.comparator, a.code.as_ref()?, b.code.as_ref()?)),
            Field::Category => Some(compare_text(
                self.comparator,
                a.category.as_ref()?,
                b.category.as_ref()?,
            )),
            Field::Attributes => Some(compare_text(
                self.comparator,
                &attribute_text(a)?,
                &attribute_text(b)?,
            )),
            Field::Measures => {
                let scale = match self.comparator {
                    Comparator::Numeric { scale } => scale,
                    _ => 0.0,
                };
                let shared: Vec<f64> = a
                    .measures
                    .iter()
                    .filter_map(|(k, x)| b.measures.get(k).map(|y| numeric_score(*x, *y, scale)))
                    .collect();
                if shared.is_empty() {
                    None
                } else {
                    Some(shared.iter().sum::<f64>() / shared.len() as f64)
                }
            }
        }
    }
}

/// Published weight set; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityWeights {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub weights: BTreeMap<String, f64>,
}

impl SimilarityWeights {
    pub fn uniform(fields: &[FieldSpec]) -> Self {
        Self {
            version: 0,
            created_at: Utc::now(),
            weights: fields.iter().map(|f| (f.field.name().to_string(), 1.0)).collect(),
        }
    }

    pub fn get(&self, field: Field) -> f64 {
        self.weights.get(field.name()).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledPair {
    pub a: EntityRecord,
    pub b: EntityRecord,
    pub is_duplicate: bool,
}

impl LabeledPair {
    pub fn new(a: EntityRecord, b: EntityRecord, is_duplicate: bool) -> Self {
        Self { a, b, is_duplicate }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EvaluationMetrics {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
}

impl EvaluationMetrics {
    fn from_counts(tp: usize, fp: usize, tn: usize, fn_: usize) -> Self {
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        Self {
            true_positives: tp,
            false_positives: fp,
            true_negatives: tn,
            false_negatives: fn_,
            precision,
            recall,
            f1,
            accuracy: ratio(tp + tn, tp + fp + tn + fn_),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FoldReport {
    pub fold: usize,
    pub learned_threshold: f64,
    pub learned: EvaluationMetrics,
    pub baseline_threshold: f64,
    pub baseline: EvaluationMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossValidationReport {
    pub folds: Vec<FoldReport>,
    pub learned_mean_f1: f64,
    pub baseline_mean_f1: f64,
    pub learned_mean_accuracy: f64,
    pub baseline_mean_accuracy: f64,
}

/// Per-pair field scores, computed once per learning run
struct ScoredPair {
    fields: Vec<Option<f64>>,
    is_duplicate: bool,
}

fn combine(fields: &[FieldSpec], scores: &[Option<f64>], weights: &BTreeMap<String, f64>) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for (spec, score) in fields.iter().zip(scores) {
        if let Some(s) = score {
            let w = weights.get(spec.field.name()).copied().unwrap_or(0.0);
            num += w * s;
            den += w;
        }
    }
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

pub struct SimilarityEngine {
    config: SimilarityConfig,
    fields: Vec<FieldSpec>,
    weights: RwLock<Arc<SimilarityWeights>>,
    history: RwLock<Vec<Arc<SimilarityWeights>>>,
    /// Keyed by ordered id pair; the weights version guards against stale entries
    cache: Mutex<HashMap<(EntityId, EntityId), (u64, f64)>>,
}

impl SimilarityEngine {
    pub fn new(config: SimilarityConfig) -> Self {
        Self::with_fields(config, default_fields())
    }

    pub fn with_fields(config: SimilarityConfig, fields: Vec<FieldSpec>) -> Self {
        let weights = SimilarityWeights::uniform(&fields);
        Self {
            config,
            fields,
            weights: RwLock::new(Arc::new(weights)),
            history: RwLock::new(Vec::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn current_weights(&self) -> Arc<SimilarityWeights> {
        self.weights
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Superseded weight versions, oldest first
    pub fn history(&self) -> Vec<Arc<SimilarityWeights>> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Uniform weights over the configured fields
    pub fn baseline_weights(&self) -> SimilarityWeights {
        SimilarityWeights::uniform(&self.fields)
    }

    fn field_scores(&self, a: &EntityRecord, b: &EntityRecord) -> Vec<Option<f64>> {
        self.fields.iter().map(|f| f.score(a, b)).collect()
    }

    /// Score with explicit weights, bypassing the cache
    pub fn score_with(&self, a: &EntityRecord, b: &EntityRecord, weights: &SimilarityWeights) -> f64 {
        combine(&self.fields, &self.field_scores(a, b), &weights.weights)
    }

    /// Score with the current weights, bypassing the cache
    pub fn score(&self, a: &EntityRecord, b: &EntityRecord) -> f64 {
        self.score_with(a, b, &self.current_weights())
    }

    /// Cached comparison keyed by the records' ids
    pub fn compare(&self, a: &EntityRecord, b: &EntityRecord) -> f64 {
        let weights = self.current_weights();
        let key = if a.id <= b.id { (a.id, b.id) } else { (b.id, a.id) };

        if let Ok(cache) = self.cache.lock() {
            if let Some((version, score)) = cache.get(&key) {
                if *version == weights.version {
                    return *score;
                }
            }
        }

        let score = self.score_with(a, b, &weights);

        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() >= self.config.cache_capacity {
                debug!("Similarity cache full ({} entries), clearing", cache.len());
                cache.clear();
            }
            cache.insert(key, (weights.version, score));
        }
        score
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn score_pairs(&self, pairs: &[LabeledPair]) -> Vec<ScoredPair> {
        pairs
            .iter()
            .map(|p| ScoredPair {
                fields: self.field_scores(&p.a, &p.b),
                is_duplicate: p.is_duplicate,
            })
            .collect()
    }

    /// Mean duplicate score minus mean non-duplicate score
    fn separation(&self, scored: &[ScoredPair], weights: &BTreeMap<String, f64>) -> f64 {
        let (mut dup_sum, mut dup_n, mut non_sum, mut non_n) = (0.0, 0usize, 0.0, 0usize);
        for p in scored {
            let s = combine(&self.fields, &p.fields, weights);
            if p.is_duplicate {
                dup_sum += s;
                dup_n += 1;
            } else {
                non_sum += s;
                non_n += 1;
            }
        }
        if dup_n == 0 || non_n == 0 {
            return 0.0;
        }
        dup_sum / dup_n as f64 - non_sum / non_n as f64
    }

    /// Deterministic coordinate search from `start`. Only strict improvements are taken.
    fn fit(&self, scored: &[ScoredPair], start: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let mut best = start.clone();
        let mut best_value = self.separation(scored, &best);
        let step = self.config.learning_step;

        for round in 0..self.config.learning_rounds {
            let mut improved = false;
            for spec in &self.fields {
                let name = spec.field.name();
                for delta in [step, -step] {
                    let mut candidate = best.clone();
                    let w = candidate.entry(name.to_string()).or_insert(0.0);
                    *w = (*w + delta).max(0.0);
                    if candidate.values().all(|w| *w == 0.0) {
                        continue;
                    }
                    let value = self.separation(scored, &candidate);
                    if value > best_value + 1e-12 {
                        best = candidate;
                        best_value = value;
                        improved = true;
                    }
                }
            }
            if !improved {
                debug!("Weight search converged after {} rounds", round + 1);
                break;
            }
        }
        best
    }

    /// F1 at the best threshold for these weights
    fn best_f1(&self, scored: &[ScoredPair], weights: &BTreeMap<String, f64>) -> f64 {
        let threshold = self.optimal_threshold_scored(scored, weights);
        self.evaluate_scored(scored, weights, threshold).f1
    }

    /// `fit`, kept only when it classifies the pairs strictly better than `start`.
    /// Separation can grow on a field that ranks worse at any threshold.
    fn fit_guarded(&self, scored: &[ScoredPair], start: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let fitted = self.fit(scored, start);
        let fitted_f1 = self.best_f1(scored, &fitted);
        let start_f1 = self.best_f1(scored, start);
        if fitted_f1 > start_f1 + 1e-9 {
            fitted
        } else {
            debug!(
                "Fitted weights do not beat the starting weights (F1 {:.3} vs {:.3}), keeping start",
                fitted_f1, start_f1
            );
            start.clone()
        }
    }

    /// Fit new weights from labeled pairs and publish them as the next version.
    /// The published weights never classify the pairs worse than the current or uniform ones.
    pub fn learn(&self, pairs: &[LabeledPair]) -> CoreResult<Arc<SimilarityWeights>> {
        let duplicates = pairs.iter().filter(|p| p.is_duplicate).count();
        if duplicates == 0 || duplicates == pairs.len() {
            return Err(CoreError::InvalidInput(
                "learning needs both duplicate and non-duplicate pairs".into(),
            ));
        }

        let current = self.current_weights();
        let scored = self.score_pairs(pairs);
        let uniform = self.baseline_weights().weights;
        let start = if self.best_f1(&scored, &uniform) > self.best_f1(&scored, &current.weights) + 1e-9 {
            uniform
        } else {
            current.weights.clone()
        };
        let fitted = self.fit_guarded(&scored, &start);
        let next = Arc::new(SimilarityWeights {
            version: current.version + 1,
            created_at: Utc::now(),
            weights: fitted,
        });

        {
            let mut published = self.weights.write().unwrap_or_else(PoisonError::into_inner);
            self.history
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(published.clone());
            *published = next.clone();
        }
        self.clear_cache();

        info!(
            "Published similarity weights v{} from {} pairs: {:?}",
            next.version,
            pairs.len(),
            next.weights
        );
        Ok(next)
    }

    pub fn evaluate(
        &self,
        pairs: &[LabeledPair],
        weights: &SimilarityWeights,
        threshold: f64,
    ) -> EvaluationMetrics {
        let scored = self.score_pairs(pairs);
        self.evaluate_scored(&scored, &weights.weights, threshold)
    }

    fn evaluate_scored(
        &self,
        scored: &[ScoredPair],
        weights: &BTreeMap<String, f64>,
        threshold: f64,
    ) -> EvaluationMetrics {
        let (mut tp, mut fp, mut tn, mut fn_) = (0, 0, 0, 0);
        for p in scored {
            let predicted = combine(&self.fields, &p.fields, weights) >= threshold;
            match (predicted, p.is_duplicate) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fn_ += 1,
            }
        }
        EvaluationMetrics::from_counts(tp, fp, tn, fn_)
    }

    /// Threshold in [0.05, 0.95] maximizing F1; ties prefer the higher threshold
    pub fn optimal_threshold(
        &self,
        pairs: &[LabeledPair],
        weights: &SimilarityWeights,
    ) -> CoreResult<f64> {
        if pairs.is_empty() {
            return Err(CoreError::InvalidInput("no labeled pairs".into()));
        }
        let scored = self.score_pairs(pairs);
        Ok(self.optimal_threshold_scored(&scored, &weights.weights))
    }

    fn optimal_threshold_scored(&self, scored: &[ScoredPair], weights: &BTreeMap<String, f64>) -> f64 {
        let mut best_threshold = 0.05;
        let mut best_f1 = f64::NEG_INFINITY;
        for step in 5..=95 {
            let threshold = f64::from(step) / 100.0;
            let f1 = self.evaluate_scored(scored, weights, threshold).f1;
            if f1 >= best_f1 - 1e-12 {
                best_f1 = best_f1.max(f1);
                best_threshold = threshold;
            }
        }
        best_threshold
    }

    /// k-fold comparison of learned weights against uniform weights; nothing is published.
    /// Duplicates are dealt round-robin across folds first and non-duplicates continue the
    /// same rotation, so every fold sees both classes whenever each class has k pairs.
    pub fn cross_validate(&self, pairs: &[LabeledPair], k: usize) -> CoreResult<CrossValidationReport> {
        if k < 2 || pairs.len() < k {
            return Err(CoreError::InvalidInput(format!(
                "cross validation needs k >= 2 and at least k pairs (k={}, pairs={})",
                k,
                pairs.len()
            )));
        }

        let scored = self.score_pairs(pairs);
        let baseline = self.baseline_weights().weights;
        let mut folds = Vec::with_capacity(k);

        let assignment = fold_assignment(&scored, k);

        for fold in 0..k {
            let (test, train): (Vec<_>, Vec<_>) = scored
                .iter()
                .zip(&assignment)
                .partition(|(_, f)| **f == fold);
            let train: Vec<ScoredPair> = train
                .into_iter()
                .map(|(p, _)| ScoredPair { fields: p.fields.clone(), is_duplicate: p.is_duplicate })
                .collect();
            let test: Vec<ScoredPair> = test
                .into_iter()
                .map(|(p, _)| ScoredPair { fields: p.fields.clone(), is_duplicate: p.is_duplicate })
                .collect();

            let learned = self.fit_guarded(&train, &baseline);
            let learned_threshold = self.optimal_threshold_scored(&train, &learned);
            let baseline_threshold = self.optimal_threshold_scored(&train, &baseline);

            folds.push(FoldReport {
                fold,
                learned_threshold,
                learned: self.evaluate_scored(&test, &learned, learned_threshold),
                baseline_threshold,
                baseline: self.evaluate_scored(&test, &baseline, baseline_threshold),
            });
        }

        let mean = |f: &dyn Fn(&FoldReport) -> f64| folds.iter().map(f).sum::<f64>() / k as f64;
        Ok(CrossValidationReport {
            learned_mean_f1: mean(&|r| r.learned.f1),
            baseline_mean_f1: mean(&|r| r.baseline.f1),
            learned_mean_accuracy: mean(&|r| r.learned.accuracy),
            baseline_mean_accuracy: mean(&|r| r.baseline.accuracy),
            folds,
        })
    }
}

/// Fold index per pair: duplicates take folds 0, 1, .. in input order, non-duplicates
/// continue the rotation where the duplicates stopped
fn fold_assignment(scored: &[ScoredPair], k: usize) -> Vec<usize> {
    let mut assignment = vec![0; scored.len()];
    let mut next = 0usize;
    for want_duplicate in [true, false] {
        for (i, p) in scored.iter().enumerate() {
            if p.is_duplicate == want_duplicate {
                assignment[i] = next % k;
                next += 1;
            }
        }
    }
    assignment
}
