//! Error taxonomy for the positioning service
//!
//! Batch-level errors (`ValidationError`) are returned synchronously on submission.
//! Everything below the batch (`TrilaterationError`, `StorageError`, `RegistryError`)
//! is contained per tag and surfaces only through logs, metrics and batch reports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural problems with a submitted batch
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("batch contains no measurements")]
    EmptyMeasurements,

    #[error("invalid gateway id: {reason}")]
    InvalidGatewayId { reason: String },

    #[error("measurement {index}: invalid {field}: {reason}")]
    InvalidIdentifier {
        index: usize,
        field: String,
        reason: String,
    },

    #[error("measurement {index}: invalid distance {value} m: {reason}")]
    InvalidDistance {
        index: usize,
        value: f64,
        reason: String,
    },

    #[error("batch has {count} measurements, limit is {max}")]
    TooManyMeasurements { count: usize, max: usize },

    #[error("batch timestamp is {skew_ms} ms in the future")]
    TimestampInFuture { skew_ms: i64 },
}

/// Failure of a single tag's position solve
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum TrilaterationError {
    #[error("insufficient measurements: {usable} usable, {required} required")]
    InsufficientMeasurements { usable: usize, required: usize },

    #[error("solver diverged: {reason}")]
    SolverDivergence { reason: String },
}

/// Persistence failures from a position store backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt record for key {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
}

/// Failures of the anchor registry collaborator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("anchor already registered: {0}")]
    DuplicateAnchor(String),

    #[error("invalid anchor {anchor_id}: {reason}")]
    InvalidAnchor { anchor_id: String, reason: String },

    #[error("anchor not found: {0}")]
    NotFound(String),

    #[error("anchor registry unavailable: {0}")]
    Unavailable(String),
}

/// Why one tag in a batch produced no position
#[derive(Debug, Error)]
pub enum TagError {
    #[error(transparent)]
    Trilateration(#[from] TrilaterationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("anchor snapshot unavailable: {0}")]
    Registry(#[from] RegistryError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TagError {
    /// Short stable label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TagError::Trilateration(TrilaterationError::InsufficientMeasurements { .. }) => {
                "insufficient_measurements"
            }
            TagError::Trilateration(TrilaterationError::SolverDivergence { .. }) => "solver_divergence",
            TagError::Storage(_) => "storage_error",
            TagError::Registry(_) => "registry_error",
            TagError::Internal(_) => "internal_error",
        }
    }
}
