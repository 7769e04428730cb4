//! Versioned normalization sessions.
//!
//! Every stage attempt appends an immutable snapshot. Calls for one session are serialized
//! by a per-session lock held for the whole stage, AI round trip included, so a revert issued
//! during an in-flight stage waits for that stage's outcome.

use crate::classification::ClassificationEngine;
use crate::config::PipelineConfig;
use crate::error::{CoreError, CoreResult};
use crate::orchestrator::WorkerOrchestrator;
use crate::patterns;
use crate::store::AuditStore;
use crate::types::{
    EntityId, ErrorDetail, NormalizationSession, SessionId, SessionStatus, Stage, StageSnapshot,
    Taxonomy, WorkerRequest,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Read-only view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub entity_id: EntityId,
    pub original_name: String,
    pub status: SessionStatus,
    /// Status implied by the cursor; differs from `status` only right after a revert
    pub effective_status: SessionStatus,
    pub current_stage_index: usize,
    pub current_value: String,
    pub snapshot_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&NormalizationSession> for SessionView {
    fn from(s: &NormalizationSession) -> Self {
        Self {
            id: s.id,
            entity_id: s.entity_id,
            original_name: s.original_name.clone(),
            status: s.status,
            effective_status: s.effective_status(),
            current_stage_index: s.current_stage_index,
            current_value: s.current_value().to_string(),
            snapshot_count: s.stage_history.len(),
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

type SessionHandle = Arc<Mutex<NormalizationSession>>;

pub struct NormalizationPipeline {
    config: PipelineConfig,
    orchestrator: Arc<WorkerOrchestrator>,
    classifier: Arc<ClassificationEngine>,
    audit: Arc<dyn AuditStore>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
}

fn detail(err: &CoreError) -> ErrorDetail {
    ErrorDetail {
        category: err.category(),
        message: err.to_string(),
    }
}

impl NormalizationPipeline {
    pub fn new(
        config: PipelineConfig,
        orchestrator: Arc<WorkerOrchestrator>,
        classifier: Arc<ClassificationEngine>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            classifier,
            audit,
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn handle(&self, id: SessionId) -> CoreResult<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("session {}", id)))
    }

    pub fn start_session(
        &self,
        entity_id: EntityId,
        original_name: &str,
    ) -> CoreResult<NormalizationSession> {
        if entity_id <= 0 {
            return Err(CoreError::InvalidInput(format!(
                "entity id must be positive, got {}",
                entity_id
            )));
        }
        if original_name.trim().is_empty() {
            return Err(CoreError::InvalidInput("original name is empty".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = NormalizationSession::new(id, entity_id, original_name);
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(Mutex::new(session.clone())));

        info!("Started session {} for entity {}", id, entity_id);
        Ok(session)
    }

    pub async fn get_session(&self, id: SessionId) -> CoreResult<SessionView> {
        let handle = self.handle(id)?;
        let session = handle.lock().await;
        Ok(SessionView::from(&*session))
    }

    pub async fn get_session_history(&self, id: SessionId) -> CoreResult<Vec<StageSnapshot>> {
        let handle = self.handle(id)?;
        let session = handle.lock().await;
        Ok(session.stage_history.clone())
    }

    /// Stage may run only from its own cursor position on a session that has not failed
    fn require_stage(session: &NormalizationSession, stage: Stage) -> CoreResult<()> {
        if session.status == SessionStatus::Failed {
            return Err(CoreError::InvalidState(format!(
                "session {} has failed; revert before applying {}",
                session.id, stage
            )));
        }
        if session.current_stage_index != stage.position() {
            return Err(CoreError::InvalidState(format!(
                "session {} is {:?}; {} is not the next stage",
                session.id,
                session.effective_status(),
                stage
            )));
        }
        Ok(())
    }

    /// Persist a successful snapshot, then advance the cursor
    async fn commit(&self, session: &mut NormalizationSession, snapshot: StageSnapshot) -> CoreResult<()> {
        self.audit.append_snapshot(session.id, &snapshot).await?;
        let stage = snapshot.stage;
        session.stage_history.push(snapshot);
        session.active_path.push(session.stage_history.len() - 1);
        session.current_stage_index = stage.position() + 1;
        session.status = stage.status_after();
        session.updated_at = Utc::now();
        Ok(())
    }

    /// Persist a failed snapshot; the session becomes `failed` and the cursor stays put
    async fn record_failure(
        &self,
        session: &mut NormalizationSession,
        snapshot: StageSnapshot,
    ) -> CoreResult<()> {
        self.audit.append_snapshot(session.id, &snapshot).await?;
        warn!(
            "Session {} failed at {}: {:?}",
            session.id, snapshot.stage, snapshot.error_detail
        );
        session.stage_history.push(snapshot);
        session.status = SessionStatus::Failed;
        session.updated_at = Utc::now();
        Ok(())
    }

    pub async fn apply_patterns(&self, id: SessionId) -> CoreResult<StageSnapshot> {
        let handle = self.handle(id)?;
        let mut session = handle.lock().await;
        Self::require_stage(&session, Stage::Patterns)?;

        let input = session.current_value().to_string();
        let output = patterns::clean(&input);
        let snapshot = StageSnapshot::succeeded(Stage::Patterns, input, output);
        self.commit(&mut session, snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// Provider failures end the session as `failed` and come back as a failed snapshot
    pub async fn apply_ai(&self, id: SessionId, use_chat_mode: bool) -> CoreResult<StageSnapshot> {
        let handle = self.handle(id)?;
        let mut session = handle.lock().await;
        Self::require_stage(&session, Stage::AiCorrection)?;

        let input = session.current_value().to_string();
        let request = WorkerRequest::correction(input.clone(), use_chat_mode);
        match self.orchestrator.execute(request, self.config.ai_timeout).await {
            Ok(response) => {
                let corrected = response.label.trim();
                let output = if corrected.is_empty() { input.clone() } else { corrected.to_string() };
                let snapshot = StageSnapshot::succeeded(Stage::AiCorrection, input, output);
                self.commit(&mut session, snapshot.clone()).await?;
                Ok(snapshot)
            }
            Err(e) => {
                let snapshot = StageSnapshot::failed(Stage::AiCorrection, input, detail(&e));
                self.record_failure(&mut session, snapshot.clone()).await?;
                Ok(snapshot)
            }
        }
    }

    /// Classify the current value under every taxonomy
    pub async fn apply_categorization(&self, id: SessionId) -> CoreResult<StageSnapshot> {
        let handle = self.handle(id)?;
        let mut session = handle.lock().await;
        Self::require_stage(&session, Stage::Categorization)?;

        let input = session.current_value().to_string();
        let entity_id = session.entity_id;
        let outcomes = join_all(
            Taxonomy::ALL
                .iter()
                .map(|t| self.classifier.classify_name(entity_id, &input, *t)),
        )
        .await;

        let mut assignments = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Ok(task) => assignments.push(task.assignment()),
                Err(e @ CoreError::StorageUnavailable(_)) => return Err(e),
                Err(e) => {
                    let snapshot = StageSnapshot::failed(Stage::Categorization, input, detail(&e));
                    self.record_failure(&mut session, snapshot.clone()).await?;
                    return Ok(snapshot);
                }
            }
        }

        let mut snapshot = StageSnapshot::succeeded(Stage::Categorization, input.clone(), input);
        snapshot.assignments = assignments;
        self.commit(&mut session, snapshot.clone()).await?;
        Ok(snapshot)
    }

    pub async fn complete(&self, id: SessionId) -> CoreResult<StageSnapshot> {
        let handle = self.handle(id)?;
        let mut session = handle.lock().await;
        Self::require_stage(&session, Stage::Completion)?;

        let value = session.current_value().to_string();
        let snapshot = StageSnapshot::succeeded(Stage::Completion, value.clone(), value);
        self.commit(&mut session, snapshot.clone()).await?;
        info!("Session {} completed", id);
        Ok(snapshot)
    }

    /// Rewind the cursor to just before `stage_name`. History is never truncated.
    pub async fn revert_stage(&self, id: SessionId, stage_name: &str) -> CoreResult<SessionView> {
        let stage = Stage::from_name(stage_name)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown stage '{}'", stage_name)))?;
        let handle = self.handle(id)?;
        let mut session = handle.lock().await;

        if !session.has_applied(stage) {
            return Err(CoreError::InvalidState(format!(
                "stage {} was never applied in session {}",
                stage, id
            )));
        }
        if stage.position() > session.current_stage_index {
            return Err(CoreError::InvalidState(format!(
                "session {} is already before {}",
                id, stage
            )));
        }

        session.current_stage_index = stage.position();
        session.active_path.truncate(stage.position());
        session.status = SessionStatus::Reverted;
        session.updated_at = Utc::now();
        info!("Session {} reverted to before {}", id, stage);
        Ok(SessionView::from(&*session))
    }

    /// Apply every remaining stage, stopping at the first failed one
    pub async fn run_to_completion(&self, id: SessionId, use_chat_mode: bool) -> CoreResult<SessionView> {
        loop {
            let view = self.get_session(id).await?;
            if view.status == SessionStatus::Failed {
                return Ok(view);
            }
            let snapshot = match view.current_stage_index {
                0 => self.apply_patterns(id).await?,
                1 => self.apply_ai(id, use_chat_mode).await?,
                2 => self.apply_categorization(id).await?,
                3 => self.complete(id).await?,
                _ => return Ok(view),
            };
            if !snapshot.success {
                return self.get_session(id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassificationConfig, OrchestratorConfig, SimilarityConfig};
    use crate::orchestrator::ProviderRegistration;
    use crate::providers::{AiProvider, ScriptedProvider};
    use crate::similarity::SimilarityEngine;
    use crate::store::{InMemoryAuditStore, InMemoryEntityStore};
    use crate::taxonomy::TaxonomyTree;
    use std::time::Duration;

    fn pipeline_with(
        correction: Arc<dyn AiProvider>,
        audit: Arc<InMemoryAuditStore>,
    ) -> NormalizationPipeline {
        let fast = OrchestratorConfig {
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..OrchestratorConfig::default()
        };
        let classifier_pool = WorkerOrchestrator::start(
            "classification",
            fast.clone(),
            vec![ProviderRegistration::new(
                Arc::new(ScriptedProvider::answering("cls", "не знаю", 0.9)),
                Duration::ZERO,
            )],
        );
        let correction_pool = WorkerOrchestrator::start(
            "correction",
            fast,
            vec![ProviderRegistration::new(correction, Duration::ZERO)],
        );
        let classifier = Arc::new(ClassificationEngine::new(
            ClassificationConfig::default(),
            Taxonomy::ALL.iter().map(|t| TaxonomyTree::builtin(*t)).collect(),
            classifier_pool,
            Arc::new(SimilarityEngine::new(SimilarityConfig::default())),
            Arc::new(InMemoryEntityStore::new()),
            audit.clone(),
        ));
        NormalizationPipeline::new(PipelineConfig::default(), correction_pool, classifier, audit)
    }

    fn pipeline() -> NormalizationPipeline {
        pipeline_with(Arc::new(ScriptedProvider::echo("echo")), Arc::new(InMemoryAuditStore::new()))
    }

    #[tokio::test]
    async fn test_start_session_validation() {
        let p = pipeline();
        assert!(matches!(p.start_session(0, "Болт"), Err(CoreError::InvalidInput(_))));
        assert!(matches!(p.start_session(1, "   "), Err(CoreError::InvalidInput(_))));
        assert!(matches!(p.apply_patterns(42).await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stage_order_is_enforced() {
        let p = pipeline();
        let s = p.start_session(1, "Болт М10").unwrap();
        assert!(matches!(p.apply_ai(s.id, false).await, Err(CoreError::InvalidState(_))));
        p.apply_patterns(s.id).await.unwrap();
        assert!(matches!(p.apply_patterns(s.id).await, Err(CoreError::InvalidState(_))));
        assert!(matches!(p.complete(s.id).await, Err(CoreError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_full_run_records_assignments() {
        let audit = Arc::new(InMemoryAuditStore::new());
        let p = pipeline_with(Arc::new(ScriptedProvider::echo("echo")), audit.clone());
        let s = p.start_session(5, "  БОЛТ М10х40 (оцинк.) ").unwrap();

        let view = p.run_to_completion(s.id, true).await.unwrap();

        assert_eq!(view.status, SessionStatus::Completed);
        assert_eq!(view.current_value, "болт м10х40 оцинкованный");
        let history = p.get_session_history(s.id).await.unwrap();
        let stages: Vec<_> = history.iter().map(|h| h.stage).collect();
        assert_eq!(stages, Stage::ORDER.to_vec());
        let categorization = &history[2];
        assert_eq!(categorization.assignments.len(), 2);
        assert!(categorization
            .assignments
            .iter()
            .any(|a| a.code.as_deref() == Some("25.94.11")));
        assert_eq!(audit.snapshots(s.id).len(), 4);
    }

    #[tokio::test]
    async fn test_revert_errors() {
        let p = pipeline();
        let s = p.start_session(1, "Болт").unwrap();
        assert!(matches!(p.revert_stage(s.id, "bogus").await, Err(CoreError::InvalidInput(_))));
        assert!(matches!(
            p.revert_stage(s.id, "patterns").await,
            Err(CoreError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_ai_failure_fails_session_and_revert_recovers() {
        use crate::error::ErrorCategory;
        use crate::providers::ProviderFailure;

        let flaky = ScriptedProvider::echo("flaky")
            .with_script(vec![Err(ProviderFailure::Client("bad prompt".into()))]);
        let p = pipeline_with(Arc::new(flaky), Arc::new(InMemoryAuditStore::new()));
        let s = p.start_session(1, "Гайка М8").unwrap();
        p.apply_patterns(s.id).await.unwrap();

        let failed = p.apply_ai(s.id, false).await.unwrap();
        assert!(!failed.success);
        assert_eq!(
            failed.error_detail.as_ref().map(|d| d.category),
            Some(ErrorCategory::AllProvidersExhausted)
        );
        assert_eq!(p.get_session(s.id).await.unwrap().status, SessionStatus::Failed);
        assert!(matches!(p.apply_categorization(s.id).await, Err(CoreError::InvalidState(_))));

        let reverted = p.revert_stage(s.id, "ai_correction").await.unwrap();
        assert_eq!(reverted.status, SessionStatus::Reverted);
        assert_eq!(reverted.effective_status, SessionStatus::PatternsApplied);

        let retried = p.apply_ai(s.id, false).await.unwrap();
        assert!(retried.success);
        assert_eq!(p.get_session_history(s.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_audit_failure_leaves_session_unchanged() {
        let audit = Arc::new(InMemoryAuditStore::new());
        let p = pipeline_with(Arc::new(ScriptedProvider::echo("echo")), audit.clone());
        let s = p.start_session(1, "Болт").unwrap();
        audit.set_failing(true);

        assert!(matches!(p.apply_patterns(s.id).await, Err(CoreError::StorageUnavailable(_))));
        let view = p.get_session(s.id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Created);
        assert_eq!(view.snapshot_count, 0);
    }
}
