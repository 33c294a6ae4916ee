//! Request and response types of the positioning service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{BatchId, CurrentPosition};
use crate::utils::config::ConfigError;
use crate::validation::error::{RegistryError, StorageError, ValidationError};

/// Result type for service operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Service error types
#[derive(Debug, Error)]
pub enum ApiError {
    /// The batch failed structural validation and was not accepted
    #[error("invalid batch: {0}")]
    Validation(#[from] ValidationError),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
}

impl ApiError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        ApiError::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

/// Admission state reported to gateways
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptanceStatus {
    Accepted,
}

/// Synchronous response to a batch submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAccepted {
    pub status: AcceptanceStatus,
    pub batch_id: BatchId,
}

impl BatchAccepted {
    pub fn new(batch_id: BatchId) -> Self {
        Self {
            status: AcceptanceStatus::Accepted,
            batch_id,
        }
    }
}

/// Current position of one tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionResponse {
    pub tag_id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Largest absolute range residual of the fix (meters)
    pub accuracy: f64,
    /// Measurement time of the batch that produced the fix
    pub timestamp: DateTime<Utc>,
}

impl From<CurrentPosition> for PositionResponse {
    fn from(current: CurrentPosition) -> Self {
        Self {
            tag_id: current.tag_id,
            x: current.position.x,
            y: current.position.y,
            z: current.position.z,
            accuracy: current.accuracy,
            timestamp: current.measured_at,
        }
    }
}
