//! Classification engine: runs strategies in priority order and tracks review feedback

use crate::config::ClassificationConfig;
use crate::error::{CoreError, CoreResult};
use crate::orchestrator::{OrchestratorStatus, WorkerOrchestrator};
use crate::patterns;
use crate::similarity::SimilarityEngine;
use crate::store::{AuditStore, EntityStore};
use crate::strategies::{builtin_rules, Candidate, ClassifyContext, ExactMatchCache, PatternRule, StrategyDeps};
use crate::taxonomy::TaxonomyTree;
use crate::types::{
    BatchResult, ClassificationTask, EntityId, EntityRecord, ErrorDetail, TaskId, TaskStatus,
    Taxonomy,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Aggregate accuracy over classified tasks
#[derive(Debug, Clone, Serialize)]
pub struct AccuracyReport {
    pub considered: usize,
    pub correct: usize,
    pub marked_correct: usize,
    pub marked_incorrect: usize,
    pub low_confidence: usize,
    pub accuracy: f64,
}

pub struct ClassificationEngine {
    trees: HashMap<Taxonomy, TaxonomyTree>,
    deps: StrategyDeps,
    store: Arc<dyn EntityStore>,
    audit: Arc<dyn AuditStore>,
    tasks: Mutex<BTreeMap<TaskId, ClassificationTask>>,
    next_task: AtomicU64,
}

impl ClassificationEngine {
    pub fn new(
        config: ClassificationConfig,
        trees: Vec<TaxonomyTree>,
        orchestrator: Arc<WorkerOrchestrator>,
        similarity: Arc<SimilarityEngine>,
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self::with_rules(config, trees, builtin_rules(), orchestrator, similarity, store, audit)
    }

    pub fn with_rules(
        config: ClassificationConfig,
        trees: Vec<TaxonomyTree>,
        rules: Vec<PatternRule>,
        orchestrator: Arc<WorkerOrchestrator>,
        similarity: Arc<SimilarityEngine>,
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            trees: trees.into_iter().map(|t| (t.taxonomy(), t)).collect(),
            deps: StrategyDeps {
                config,
                cache: ExactMatchCache::default(),
                rules,
                orchestrator,
                similarity,
                store: store.clone(),
            },
            store,
            audit,
            tasks: Mutex::new(BTreeMap::new()),
            next_task: AtomicU64::new(1),
        }
    }

    fn tree(&self, taxonomy: Taxonomy) -> CoreResult<&TaxonomyTree> {
        self.trees
            .get(&taxonomy)
            .ok_or_else(|| CoreError::InvalidInput(format!("no tree loaded for {}", taxonomy)))
    }

    pub fn exact_match_cache(&self) -> &ExactMatchCache {
        &self.deps.cache
    }

    /// Classify an entity under its stored name
    pub async fn classify_entity(
        &self,
        entity_id: EntityId,
        taxonomy: Taxonomy,
    ) -> CoreResult<ClassificationTask> {
        if entity_id <= 0 {
            return Err(CoreError::InvalidInput(format!(
                "entity id must be positive, got {}",
                entity_id
            )));
        }
        let entity = self
            .store
            .get_entity(entity_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("entity {}", entity_id)))?;
        let name = entity.name.clone();
        self.classify_record(&entity, &name, taxonomy).await
    }

    /// Classify under a caller-supplied name. Stored attributes are used as hints when present.
    pub async fn classify_name(
        &self,
        entity_id: EntityId,
        name: &str,
        taxonomy: Taxonomy,
    ) -> CoreResult<ClassificationTask> {
        if entity_id <= 0 {
            return Err(CoreError::InvalidInput(format!("entity id must be positive, got {}", entity_id)));
        }
        let entity = self
            .store
            .get_entity(entity_id)
            .await?
            .unwrap_or_else(|| EntityRecord::new(entity_id, name));
        self.classify_record(&entity, name, taxonomy).await
    }

    async fn classify_record(
        &self,
        entity: &EntityRecord,
        raw_name: &str,
        taxonomy: Taxonomy,
    ) -> CoreResult<ClassificationTask> {
        let name = patterns::clean(raw_name);
        if name.is_empty() {
            return Err(CoreError::InvalidInput(format!(
                "name of entity {} is empty after cleanup",
                entity.id
            )));
        }
        let tree = self.tree(taxonomy)?;

        let now = Utc::now();
        let mut task = ClassificationTask {
            id: self.next_task.fetch_add(1, Ordering::SeqCst),
            entity_id: entity.id,
            taxonomy,
            name: name.clone(),
            candidate_code: None,
            candidate_label: None,
            confidence: 0.0,
            strategy_used: None,
            status: TaskStatus::Running,
            low_confidence: false,
            incorrect_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.audit.append_task(&task).await?;

        let threshold = self.deps.config.threshold(taxonomy);
        let ctx = ClassifyContext::new(entity, &name, taxonomy, tree);
        let mut accepted: Option<Candidate> = None;
        let mut best: Option<Candidate> = None;

        for kind in &self.deps.config.priority {
            let found = match kind.classify(&ctx, &self.deps).await {
                Ok(found) => found,
                Err(e) => {
                    task.status = TaskStatus::Failed;
                    task.updated_at = Utc::now();
                    if let Err(audit_err) = self.audit.append_task(&task).await {
                        warn!("Could not record failure of task {}: {}", task.id, audit_err);
                    }
                    self.tasks.lock().await.insert(task.id, task);
                    return Err(e);
                }
            };
            let Some(candidate) = found else {
                debug!("{} abstained for '{}'", kind.name(), name);
                continue;
            };
            if candidate.confidence >= threshold {
                accepted = Some(candidate);
                break;
            }
            // Earlier strategies keep ties
            if best.as_ref().map_or(true, |b| candidate.confidence > b.confidence) {
                best = Some(candidate);
            }
        }

        task.low_confidence = accepted.is_none() && best.is_some();
        if let Some(c) = accepted.or(best) {
            task.candidate_code = Some(c.code);
            task.candidate_label = Some(c.label);
            task.confidence = c.confidence;
            task.strategy_used = Some(c.strategy);
        }
        task.status = TaskStatus::Completed;
        task.updated_at = Utc::now();

        self.audit.append_task(&task).await?;
        self.tasks.lock().await.insert(task.id, task.clone());

        match &task.candidate_code {
            Some(code) => info!(
                "Entity {} classified {} -> {} ({:.2} via {:?}{})",
                task.entity_id,
                taxonomy,
                code,
                task.confidence,
                task.strategy_used,
                if task.low_confidence { ", low confidence" } else { "" }
            ),
            None => info!("Entity {} left unclassified in {}", task.entity_id, taxonomy),
        }
        Ok(task)
    }

    pub async fn get_task(&self, task_id: TaskId) -> CoreResult<ClassificationTask> {
        self.tasks
            .lock()
            .await
            .get(&task_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("classification task {}", task_id)))
    }

    pub async fn tasks_for_entity(&self, entity_id: EntityId) -> Vec<ClassificationTask> {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| t.entity_id == entity_id)
            .cloned()
            .collect()
    }

    /// Confirm a task; its mapping feeds exact-match lookups
    pub async fn mark_correct(&self, task_id: TaskId) -> CoreResult<ClassificationTask> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get(&task_id)
            .ok_or_else(|| CoreError::NotFound(format!("classification task {}", task_id)))?;
        let code = match (&task.status, &task.candidate_code) {
            (
                TaskStatus::Completed | TaskStatus::MarkedIncorrect | TaskStatus::MarkedCorrect,
                Some(code),
            ) => code.clone(),
            _ => {
                return Err(CoreError::InvalidState(format!(
                    "task {} has no completed candidate to confirm",
                    task_id
                )))
            }
        };

        let mut updated = task.clone();
        updated.status = TaskStatus::MarkedCorrect;
        updated.incorrect_reason = None;
        updated.updated_at = Utc::now();
        self.audit.append_task(&updated).await?;

        self.deps
            .cache
            .remember(updated.taxonomy, &updated.name, &code, updated.id);
        tasks.insert(task_id, updated.clone());
        info!("Task {} marked correct ({} -> {})", task_id, updated.name, code);
        Ok(updated)
    }

    /// Reject a task; any memoized mapping that produced it is dropped
    pub async fn mark_incorrect(
        &self,
        task_id: TaskId,
        reason: Option<String>,
    ) -> CoreResult<ClassificationTask> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get(&task_id)
            .ok_or_else(|| CoreError::NotFound(format!("classification task {}", task_id)))?;
        if !matches!(task.status, TaskStatus::Completed | TaskStatus::MarkedCorrect) {
            return Err(CoreError::InvalidState(format!(
                "task {} is {:?} and cannot be marked incorrect",
                task_id, task.status
            )));
        }

        let mut updated = task.clone();
        updated.status = TaskStatus::MarkedIncorrect;
        updated.incorrect_reason = reason;
        updated.updated_at = Utc::now();
        self.audit.append_task(&updated).await?;

        if let Some(code) = &updated.candidate_code {
            if self.deps.cache.forget(updated.taxonomy, &updated.name, code) {
                debug!("Dropped exact-match mapping '{}' -> {}", updated.name, code);
            }
        }
        tasks.insert(task_id, updated.clone());
        info!("Task {} marked incorrect", task_id);
        Ok(updated)
    }

    /// Re-run entities that were never classified, were low confidence or were rejected.
    /// Confirmed and confidently accepted entities are skipped unless `force` is set.
    pub async fn reclassify_hierarchical(
        &self,
        entity_ids: &[EntityId],
        taxonomy: Taxonomy,
        force: bool,
    ) -> CoreResult<BatchResult> {
        let mut result = BatchResult::default();
        for &entity_id in entity_ids {
            let latest = self
                .tasks
                .lock()
                .await
                .values()
                .filter(|t| t.entity_id == entity_id && t.taxonomy == taxonomy)
                .last()
                .cloned();

            let settled = latest.as_ref().is_some_and(|t| match t.status {
                TaskStatus::MarkedCorrect => true,
                TaskStatus::Completed => !t.needs_review(),
                _ => false,
            });
            if settled && !force {
                result.skipped.push(entity_id);
                continue;
            }

            match self.classify_entity(entity_id, taxonomy).await {
                Ok(task) => result.processed.push(task),
                Err(e @ CoreError::StorageUnavailable(_)) => return Err(e),
                Err(e) => result.failed.push((
                    entity_id,
                    ErrorDetail {
                        category: e.category(),
                        message: e.to_string(),
                    },
                )),
            }
        }
        info!(
            "Reclassified {}: {} processed, {} skipped, {} failed",
            taxonomy,
            result.processed.len(),
            result.skipped.len(),
            result.failed.len()
        );
        Ok(result)
    }

    async fn reset_where(&self, what: &str, pred: impl Fn(&ClassificationTask) -> bool) -> CoreResult<usize> {
        let mut tasks = self.tasks.lock().await;
        let ids: Vec<TaskId> = tasks.values().filter(|t| pred(t)).map(|t| t.id).collect();
        for id in &ids {
            if let Some(task) = tasks.get_mut(id) {
                let mut updated = task.clone();
                updated.status = TaskStatus::Pending;
                updated.updated_at = Utc::now();
                self.audit.append_task(&updated).await?;
                *task = updated;
            }
        }
        info!("Reset {} tasks ({})", ids.len(), what);
        Ok(ids.len())
    }

    /// Send every non-confirmed task carrying `code` back to pending
    pub async fn reset_by_code(&self, code: &str) -> CoreResult<usize> {
        self.reset_where(&format!("code {}", code), |t| {
            t.candidate_code.as_deref() == Some(code)
                && matches!(
                    t.status,
                    TaskStatus::Completed | TaskStatus::MarkedIncorrect | TaskStatus::Failed
                )
        })
        .await
    }

    /// Send completed tasks below `threshold` back to pending
    pub async fn reset_low_confidence(&self, threshold: f64) -> CoreResult<usize> {
        self.reset_where(&format!("confidence < {}", threshold), |t| {
            t.status == TaskStatus::Completed && t.confidence < threshold
        })
        .await
    }

    /// Share of classified tasks that stand: confirmed, or accepted above threshold.
    /// Rejected tasks count only when `include_incorrect` is set.
    pub async fn accuracy(&self, include_incorrect: bool) -> AccuracyReport {
        let tasks = self.tasks.lock().await;
        let mut report = AccuracyReport {
            considered: 0,
            correct: 0,
            marked_correct: 0,
            marked_incorrect: 0,
            low_confidence: 0,
            accuracy: 0.0,
        };
        for task in tasks.values().filter(|t| t.candidate_code.is_some()) {
            match task.status {
                TaskStatus::MarkedCorrect => {
                    report.marked_correct += 1;
                    report.considered += 1;
                    report.correct += 1;
                }
                TaskStatus::MarkedIncorrect => {
                    report.marked_incorrect += 1;
                    if include_incorrect {
                        report.considered += 1;
                    }
                }
                TaskStatus::Completed => {
                    report.considered += 1;
                    if task.low_confidence {
                        report.low_confidence += 1;
                    } else {
                        report.correct += 1;
                    }
                }
                _ => {}
            }
        }
        if report.considered > 0 {
            report.accuracy = report.correct as f64 / report.considered as f64;
        }
        report
    }

    pub fn workers_status(&self) -> OrchestratorStatus {
        self.deps.orchestrator.status()
    }

    pub fn stop_workers(&self) -> OrchestratorStatus {
        self.deps.orchestrator.stop();
        self.workers_status()
    }

    pub fn pause_workers(&self) -> OrchestratorStatus {
        self.deps.orchestrator.pause();
        self.workers_status()
    }

    pub fn resume_workers(&self) -> OrchestratorStatus {
        self.deps.orchestrator.resume();
        self.workers_status()
    }
}
