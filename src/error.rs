//! Error taxonomy shared by the pipeline, classification and worker pool

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by core operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("provider {provider} rejected credentials: {message}")]
    ProviderAuth { provider: String, message: String },

    #[error("provider {provider} rate limited: {message}")]
    ProviderRateLimited { provider: String, message: String },

    #[error("provider {provider} server error: {message}")]
    ProviderServer { provider: String, message: String },

    #[error("provider {provider} rejected request: {message}")]
    ProviderClient { provider: String, message: String },

    #[error("provider {provider} timed out")]
    ProviderTimeout { provider: String },

    #[error("all providers exhausted (last error: {last_error})")]
    AllProvidersExhausted { last_error: String },

    #[error("worker queue is full")]
    Busy,

    #[error("worker pool stopped before task started")]
    WorkerStopped,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Serializable error category recorded in snapshots and task records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InvalidInput,
    NotFound,
    InvalidState,
    ProviderAuthError,
    ProviderRateLimited,
    ProviderServerError,
    ProviderClientError,
    ProviderTimeout,
    AllProvidersExhausted,
    Busy,
    WorkerStopped,
    StorageUnavailable,
}

impl CoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::InvalidInput(_) => ErrorCategory::InvalidInput,
            CoreError::NotFound(_) => ErrorCategory::NotFound,
            CoreError::InvalidState(_) => ErrorCategory::InvalidState,
            CoreError::ProviderAuth { .. } => ErrorCategory::ProviderAuthError,
            CoreError::ProviderRateLimited { .. } => ErrorCategory::ProviderRateLimited,
            CoreError::ProviderServer { .. } => ErrorCategory::ProviderServerError,
            CoreError::ProviderClient { .. } => ErrorCategory::ProviderClientError,
            CoreError::ProviderTimeout { .. } => ErrorCategory::ProviderTimeout,
            CoreError::AllProvidersExhausted { .. } => ErrorCategory::AllProvidersExhausted,
            CoreError::Busy => ErrorCategory::Busy,
            CoreError::WorkerStopped => ErrorCategory::WorkerStopped,
            CoreError::StorageUnavailable(_) => ErrorCategory::StorageUnavailable,
        }
    }

    /// Transient provider failures that are retried within the same provider
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ProviderRateLimited { .. }
                | CoreError::ProviderServer { .. }
                | CoreError::ProviderTimeout { .. }
        )
    }

    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            CoreError::ProviderAuth { .. }
                | CoreError::ProviderRateLimited { .. }
                | CoreError::ProviderServer { .. }
                | CoreError::ProviderClient { .. }
                | CoreError::ProviderTimeout { .. }
                | CoreError::AllProvidersExhausted { .. }
        )
    }
}
