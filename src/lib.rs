//! Indoor RTLS positioning core
//!
//! Gateways submit batches of anchor-to-tag range measurements. Each tag in a batch is
//! located by bounded nonlinear least-squares trilateration against the active anchors,
//! and the fix is appended to the tag's history and made its current position.

pub mod core;
pub mod algorithms;
pub mod processing;
pub mod registry;
pub mod storage;
pub mod validation;
pub mod utils;
pub mod api;

// Re-export commonly used types
pub use crate::core::{
    Anchor, AnchorSnapshot, BatchId, CalculatedPosition, CurrentPosition, Measurement, MeasurementBatch,
    Point3, MIN_MEASUREMENTS,
};
pub use algorithms::{TrilaterationEngine, TrilaterationSolution};
pub use processing::{BatchAck, BatchProcessor, BatchReport, BatchStatus, MeasurementIngestor};
pub use registry::{AnchorRegistry, InMemoryAnchorRegistry};
pub use storage::{open_store, InMemoryPositionStore, PositionStore, SledPositionStore, UpsertOutcome};
pub use validation::{BatchValidator, RegistryError, StorageError, TagError, TrilaterationError, ValidationError};
pub use utils::{ConfigurationManager, CurrentPositionPolicy, ServiceConfig};
pub use api::{ApiError, ApiResult, BatchAccepted, PositionResponse, PositioningService};
