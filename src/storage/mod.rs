//! Position store: append-only fix history plus the current position per tag

pub mod memory;
pub mod sled_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::{BatchId, CalculatedPosition, CurrentPosition};
use crate::utils::config::{CurrentPositionPolicy, StoreBackend, StoreConfig};
use crate::validation::error::StorageError;

pub use memory::InMemoryPositionStore;
pub use sled_store::SledPositionStore;

/// What an upsert did to the tag's current-position row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// The policy kept the stored row
    KeptExisting,
}

/// Durable positions per tag
///
/// Implementations must isolate upserts per tag: concurrent writes for different tags
/// never wait on each other.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Append one history row.
    async fn record_calculated_position(&self, record: CalculatedPosition) -> Result<(), StorageError>;

    /// Write the tag's current position subject to the store's policy.
    async fn upsert_current_position(&self, current: CurrentPosition) -> Result<UpsertOutcome, StorageError>;

    /// `None` when the tag has never been positioned (or was removed).
    async fn get_current_position(&self, tag_id: &str) -> Result<Option<CurrentPosition>, StorageError>;

    async fn list_current_positions(&self) -> Result<Vec<CurrentPosition>, StorageError>;

    /// Drop the tag's current position. History rows are kept.
    async fn remove_tag(&self, tag_id: &str) -> Result<bool, StorageError>;

    /// History rows for a tag, newest first.
    async fn history_for_tag(
        &self,
        tag_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CalculatedPosition>, StorageError>;

    async fn positions_for_batch(&self, batch_id: BatchId) -> Result<Vec<CalculatedPosition>, StorageError>;
}

impl CurrentPositionPolicy {
    /// Whether `incoming` should overwrite `existing`
    ///
    /// Under `NewestMeasurementWins` equal measurement times replace, so a re-solve of
    /// the same measurement instant still lands.
    pub fn should_replace(&self, existing: &CurrentPosition, incoming: &CurrentPosition) -> bool {
        match self {
            CurrentPositionPolicy::LastWriteWins => true,
            CurrentPositionPolicy::NewestMeasurementWins => incoming.measured_at >= existing.measured_at,
        }
    }
}

/// Open the backend named in the configuration
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn PositionStore>, StorageError> {
    let policy = config.current_position_policy;
    match &config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryPositionStore::new(policy))),
        StoreBackend::Sled { path } => Ok(Arc::new(SledPositionStore::open_path(path, policy)?)),
    }
}
