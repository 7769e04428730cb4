//! Catalog normalizer
//!
//! Normalization and classification core for ERP catalog records:
//! - Staged name normalization with snapshot history and revert
//! - Strategy-chain classification into two taxonomies
//! - Provider failover worker pool with rate limiting and health tracking
//! - Learned similarity weights and duplicate grouping

pub mod types;
pub mod error;
pub mod config;
pub mod patterns;
pub mod providers;
pub mod orchestrator;
pub mod store;
pub mod taxonomy;
pub mod similarity;
pub mod duplicates;
pub mod strategies;
pub mod classification;
pub mod pipeline;
pub mod server;

pub use types::*;
pub use error::{CoreError, CoreResult, ErrorCategory};
pub use config::CoreConfig;
pub use providers::{AiProvider, HttpProvider, ProviderFailure, ScriptedProvider};
pub use orchestrator::{OrchestratorStatus, PoolState, ProviderRegistration, WorkerOrchestrator};
pub use store::{AuditStore, EntityStore, InMemoryAuditStore, InMemoryEntityStore};
pub use taxonomy::TaxonomyTree;
pub use similarity::{LabeledPair, SimilarityEngine, SimilarityWeights};
pub use duplicates::DuplicateDetector;
pub use classification::{AccuracyReport, ClassificationEngine};
pub use pipeline::{NormalizationPipeline, SessionView};
pub use server::AppState;

#[cfg(test)]
mod tests;
