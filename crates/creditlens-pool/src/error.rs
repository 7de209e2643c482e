//! Error types for the model pool.

use std::time::Duration;

use thiserror::Error;

use crate::entry::LeaseId;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The factory or the initial probe failed while building a handle.
    #[error("Construction failed for '{model_type}': {reason}")]
    ConstructionFailed { model_type: String, reason: String },

    /// The caller's deadline passed while waiting for capacity or initialization.
    #[error("Timed out after {waited:?} waiting for a '{model_type}' connection")]
    AcquireTimeout { model_type: String, waited: Duration },

    #[error("Model pool is shut down")]
    Shutdown,

    #[error("No factory registered for model type: {0}")]
    UnknownModelType(String),

    #[error("Unknown or already released lease: {0}")]
    UnknownLease(LeaseId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PoolError {
    /// Whether retrying the same `acquire` later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::AcquireTimeout { .. } | PoolError::ConstructionFailed { .. }
        )
    }
}
