//! Catalog normalizer HTTP server binary

use anyhow::Context;
use catalog_normalizer::{
    config::providers_from_env, server, AiProvider, AppState, AuditStore, ClassificationEngine,
    CoreConfig, DuplicateDetector, EntityRecord, EntityStore, HttpProvider, InMemoryAuditStore,
    InMemoryEntityStore, NormalizationPipeline, ProviderRegistration, ScriptedProvider,
    SimilarityEngine, Taxonomy, TaxonomyTree, WorkerOrchestrator,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn load_entities() -> anyhow::Result<Vec<EntityRecord>> {
    let path = match std::env::var("CATNORM_ENTITIES_FILE") {
        Ok(p) => p,
        Err(_) => return Ok(Vec::new()),
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read entities file {}", path))?;
    let entities: Vec<EntityRecord> =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path))?;
    info!("Loaded {} entities from {}", entities.len(), path);
    Ok(entities)
}

fn registrations(call_timeout: Duration) -> anyhow::Result<Vec<ProviderRegistration>> {
    let endpoints = providers_from_env()?;
    if endpoints.is_empty() {
        warn!("CATNORM_PROVIDERS is not set; running with the offline echo provider");
        let echo: Arc<dyn AiProvider> = Arc::new(ScriptedProvider::echo("offline-echo"));
        return Ok(vec![ProviderRegistration::new(echo, Duration::ZERO)]);
    }

    endpoints
        .into_iter()
        .map(|ep| -> anyhow::Result<ProviderRegistration> {
            info!("Provider {} at {} (min interval {:?})", ep.name, ep.url, ep.min_interval);
            let provider: Arc<dyn AiProvider> =
                Arc::new(HttpProvider::new(ep.name, ep.url, ep.api_key, call_timeout)?);
            Ok(ProviderRegistration::new(provider, ep.min_interval))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    info!("Catalog normalizer v{}", env!("CARGO_PKG_VERSION"));

    let config = CoreConfig::from_env()?;
    let port: u16 = std::env::var("CATNORM_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8090);

    let correction_pool = WorkerOrchestrator::start(
        "correction",
        config.orchestrator.clone(),
        registrations(config.pipeline.ai_timeout)?,
    );
    let classification_pool = WorkerOrchestrator::start(
        "classification",
        config.orchestrator.clone(),
        registrations(config.classification.ai_timeout)?,
    );

    let entities = InMemoryEntityStore::with_entities(load_entities()?);
    let store: Arc<dyn EntityStore> = Arc::new(entities);
    let audit: Arc<dyn AuditStore> = Arc::new(InMemoryAuditStore::new());
    let similarity = Arc::new(SimilarityEngine::new(config.similarity.clone()));
    let trees = Taxonomy::ALL.iter().map(|t| TaxonomyTree::builtin(*t)).collect();

    let classifier = Arc::new(ClassificationEngine::new(
        config.classification.clone(),
        trees,
        classification_pool.clone(),
        similarity.clone(),
        store.clone(),
        audit.clone(),
    ));
    let pipeline = Arc::new(NormalizationPipeline::new(
        config.pipeline.clone(),
        correction_pool.clone(),
        classifier.clone(),
        audit,
    ));
    let duplicates = Arc::new(DuplicateDetector::new(
        config.duplicates.clone(),
        similarity,
        store,
    ));

    let state = Arc::new(AppState {
        pipeline,
        classifier,
        duplicates,
        correction_pool,
        classification_pool,
    });

    server::run_server(state, port).await
}
