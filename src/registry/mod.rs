//! Anchor registry collaborator
//!
//! The positioning core only reads from the registry: once per batch it takes a snapshot of
//! the active anchors. Listing, lookup and deletion are passed through for the service API.

pub mod memory;

use async_trait::async_trait;

use crate::core::{Anchor, AnchorSnapshot};
use crate::validation::error::RegistryError;

pub use memory::InMemoryAnchorRegistry;

/// Source of fixed anchor positions and their active flags
#[async_trait]
pub trait AnchorRegistry: Send + Sync {
    async fn list_anchors(&self) -> Result<Vec<Anchor>, RegistryError>;

    async fn get_anchor(&self, anchor_id: &str) -> Result<Option<Anchor>, RegistryError>;

    /// Returns false when no such anchor existed.
    async fn delete_anchor(&self, anchor_id: &str) -> Result<bool, RegistryError>;

    /// Positions of every anchor with `is_active = true`.
    async fn list_active_anchors(&self) -> Result<AnchorSnapshot, RegistryError> {
        let anchors = self.list_anchors().await?;
        Ok(AnchorSnapshot::from_anchors(&anchors))
    }
}
