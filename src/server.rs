//! HTTP surface over the normalization core

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    AccuracyReport, BatchResult, ClassificationEngine, ClassificationTask, CoreError,
    DuplicateDetector, DuplicateGroup, EntityId, ErrorCategory, GroupId, NormalizationPipeline,
    OrchestratorStatus, ProviderStats, Resolution, SessionId, SessionView, StageSnapshot, TaskId,
    Taxonomy, WorkerOrchestrator,
};

/// Everything the handlers reach
pub struct AppState {
    pub pipeline: Arc<NormalizationPipeline>,
    pub classifier: Arc<ClassificationEngine>,
    pub duplicates: Arc<DuplicateDetector>,
    pub correction_pool: Arc<WorkerOrchestrator>,
    pub classification_pool: Arc<WorkerOrchestrator>,
}

type Shared = Arc<AppState>;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub category: ErrorCategory,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

pub fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::InvalidState(_) => StatusCode::CONFLICT,
        CoreError::Busy => StatusCode::TOO_MANY_REQUESTS,
        CoreError::WorkerStopped | CoreError::StorageUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CoreError::ProviderAuth { .. }
        | CoreError::ProviderRateLimited { .. }
        | CoreError::ProviderServer { .. }
        | CoreError::ProviderClient { .. }
        | CoreError::ProviderTimeout { .. }
        | CoreError::AllProvidersExhausted { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            category: self.0.category(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub entity_id: EntityId,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApplyAiRequest {
    #[serde(default)]
    pub use_chat_mode: bool,
}

#[derive(Debug, Deserialize)]
pub struct RevertRequest {
    pub stage: String,
}

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub entity_id: EntityId,
    pub taxonomy: Taxonomy,
    /// Classify this name instead of the stored one
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReclassifyRequest {
    pub entity_ids: Vec<EntityId>,
    pub taxonomy: Taxonomy,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkIncorrectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    pub entity_ids: Vec<EntityId>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub resolution: Resolution,
    #[serde(default)]
    pub representative_id: Option<EntityId>,
}

#[derive(Debug, Serialize)]
pub struct ProviderStatsResponse {
    pub correction: Vec<ProviderStats>,
    pub classification: Vec<ProviderStats>,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "catalog-normalizer".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn start_session(
    State(state): State<Shared>,
    Json(req): Json<StartSessionRequest>,
) -> ApiResult<SessionView> {
    let session = state.pipeline.start_session(req.entity_id, &req.name)?;
    Ok(Json(SessionView::from(&session)))
}

async fn get_session(State(state): State<Shared>, Path(id): Path<SessionId>) -> ApiResult<SessionView> {
    Ok(Json(state.pipeline.get_session(id).await?))
}

async fn session_history(
    State(state): State<Shared>,
    Path(id): Path<SessionId>,
) -> ApiResult<Vec<StageSnapshot>> {
    Ok(Json(state.pipeline.get_session_history(id).await?))
}

async fn apply_patterns(
    State(state): State<Shared>,
    Path(id): Path<SessionId>,
) -> ApiResult<StageSnapshot> {
    Ok(Json(state.pipeline.apply_patterns(id).await?))
}

async fn apply_ai(
    State(state): State<Shared>,
    Path(id): Path<SessionId>,
    body: Option<Json<ApplyAiRequest>>,
) -> ApiResult<StageSnapshot> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.pipeline.apply_ai(id, req.use_chat_mode).await?))
}

async fn apply_categorization(
    State(state): State<Shared>,
    Path(id): Path<SessionId>,
) -> ApiResult<StageSnapshot> {
    Ok(Json(state.pipeline.apply_categorization(id).await?))
}

async fn complete(State(state): State<Shared>, Path(id): Path<SessionId>) -> ApiResult<StageSnapshot> {
    Ok(Json(state.pipeline.complete(id).await?))
}

async fn revert(
    State(state): State<Shared>,
    Path(id): Path<SessionId>,
    Json(req): Json<RevertRequest>,
) -> ApiResult<SessionView> {
    Ok(Json(state.pipeline.revert_stage(id, &req.stage).await?))
}

async fn classify(
    State(state): State<Shared>,
    Json(req): Json<ClassifyRequest>,
) -> ApiResult<ClassificationTask> {
    let task = match &req.name {
        Some(name) => {
            state
                .classifier
                .classify_name(req.entity_id, name, req.taxonomy)
                .await?
        }
        None => state.classifier.classify_entity(req.entity_id, req.taxonomy).await?,
    };
    Ok(Json(task))
}

async fn reclassify(
    State(state): State<Shared>,
    Json(req): Json<ReclassifyRequest>,
) -> ApiResult<BatchResult> {
    Ok(Json(
        state
            .classifier
            .reclassify_hierarchical(&req.entity_ids, req.taxonomy, req.force)
            .await?,
    ))
}

async fn mark_correct(
    State(state): State<Shared>,
    Path(id): Path<TaskId>,
) -> ApiResult<ClassificationTask> {
    Ok(Json(state.classifier.mark_correct(id).await?))
}

async fn mark_incorrect(
    State(state): State<Shared>,
    Path(id): Path<TaskId>,
    body: Option<Json<MarkIncorrectRequest>>,
) -> ApiResult<ClassificationTask> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.classifier.mark_incorrect(id, req.reason).await?))
}

async fn accuracy(State(state): State<Shared>) -> Json<AccuracyReport> {
    Json(state.classifier.accuracy(false).await)
}

async fn workers_status(State(state): State<Shared>) -> Json<OrchestratorStatus> {
    Json(state.classifier.workers_status())
}

async fn workers_stop(State(state): State<Shared>) -> Json<OrchestratorStatus> {
    Json(state.classifier.stop_workers())
}

async fn workers_resume(State(state): State<Shared>) -> Json<OrchestratorStatus> {
    Json(state.classifier.resume_workers())
}

async fn provider_stats(State(state): State<Shared>) -> Json<ProviderStatsResponse> {
    Json(ProviderStatsResponse {
        correction: state.correction_pool.all_stats(),
        classification: state.classification_pool.all_stats(),
    })
}

async fn detect_duplicates(
    State(state): State<Shared>,
    Json(req): Json<DetectRequest>,
) -> ApiResult<Vec<DuplicateGroup>> {
    Ok(Json(state.duplicates.detect_batch(&req.entity_ids).await?))
}

async fn resolve_duplicates(
    State(state): State<Shared>,
    Path(id): Path<GroupId>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<DuplicateGroup> {
    Ok(Json(
        state
            .duplicates
            .resolve(id, req.resolution, req.representative_id)?,
    ))
}

/// One dispatch table for every route
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", post(start_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/history", get(session_history))
        .route("/sessions/:id/patterns", post(apply_patterns))
        .route("/sessions/:id/ai", post(apply_ai))
        .route("/sessions/:id/categorize", post(apply_categorization))
        .route("/sessions/:id/complete", post(complete))
        .route("/sessions/:id/revert", post(revert))
        .route("/classification/classify", post(classify))
        .route("/classification/reclassify", post(reclassify))
        .route("/classification/tasks/:id/correct", post(mark_correct))
        .route("/classification/tasks/:id/incorrect", post(mark_incorrect))
        .route("/classification/accuracy", get(accuracy))
        .route("/classification/workers", get(workers_status))
        .route("/classification/workers/stop", post(workers_stop))
        .route("/classification/workers/resume", post(workers_resume))
        .route("/providers/stats", get(provider_stats))
        .route("/duplicates/detect", post(detect_duplicates))
        .route("/duplicates/:id/resolve", post(resolve_duplicates))
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!("Starting catalog normalizer on {}", addr);

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&CoreError::InvalidInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&CoreError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&CoreError::InvalidState("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&CoreError::Busy), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(&CoreError::WorkerStopped), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&CoreError::AllProvidersExhausted { last_error: "x".into() }),
            StatusCode::BAD_GATEWAY
        );
    }
}
