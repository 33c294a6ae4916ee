use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use super::AnchorRegistry;
use crate::core::Anchor;
use crate::validation::error::RegistryError;

/// Process-local anchor registry keyed by anchor id
#[derive(Debug, Default)]
pub struct InMemoryAnchorRegistry {
    anchors: DashMap<String, Anchor>,
}

impl InMemoryAnchorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a fixed anchor list, rejecting duplicates.
    pub fn with_anchors(anchors: impl IntoIterator<Item = Anchor>) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for anchor in anchors {
            registry.register_anchor(anchor)?;
        }
        Ok(registry)
    }

    pub fn register_anchor(&self, anchor: Anchor) -> Result<(), RegistryError> {
        if anchor.anchor_id.trim().is_empty() {
            return Err(RegistryError::InvalidAnchor {
                anchor_id: anchor.anchor_id,
                reason: "empty anchor id".to_string(),
            });
        }
        if anchor.anchor_id.chars().any(char::is_control) {
            return Err(RegistryError::InvalidAnchor {
                anchor_id: anchor.anchor_id,
                reason: "anchor id contains control characters".to_string(),
            });
        }
        if !anchor.position.is_finite() {
            return Err(RegistryError::InvalidAnchor {
                anchor_id: anchor.anchor_id,
                reason: "coordinates must be finite".to_string(),
            });
        }

        match self.anchors.entry(anchor.anchor_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateAnchor(anchor.anchor_id)),
            Entry::Vacant(slot) => {
                info!(anchor_id = %anchor.anchor_id, x = anchor.position.x, y = anchor.position.y,
                      z = anchor.position.z, active = anchor.is_active, "Anchor registered");
                slot.insert(anchor);
                Ok(())
            }
        }
    }

    /// Toggle whether the anchor takes part in positioning
    pub fn set_active(&self, anchor_id: &str, active: bool) -> Result<(), RegistryError> {
        let mut anchor = self
            .anchors
            .get_mut(anchor_id)
            .ok_or_else(|| RegistryError::NotFound(anchor_id.to_string()))?;
        anchor.is_active = active;
        info!(anchor_id, active, "Anchor activity changed");
        Ok(())
    }

    pub fn record_calibration(&self, anchor_id: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut anchor = self
            .anchors
            .get_mut(anchor_id)
            .ok_or_else(|| RegistryError::NotFound(anchor_id.to_string()))?;
        anchor.last_calibration = Some(at);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

#[async_trait]
impl AnchorRegistry for InMemoryAnchorRegistry {
    async fn list_anchors(&self) -> Result<Vec<Anchor>, RegistryError> {
        let mut anchors: Vec<Anchor> = self.anchors.iter().map(|a| a.value().clone()).collect();
        anchors.sort_by(|a, b| a.anchor_id.cmp(&b.anchor_id));
        Ok(anchors)
    }

    async fn get_anchor(&self, anchor_id: &str) -> Result<Option<Anchor>, RegistryError> {
        Ok(self.anchors.get(anchor_id).map(|a| a.value().clone()))
    }

    async fn delete_anchor(&self, anchor_id: &str) -> Result<bool, RegistryError> {
        let removed = self.anchors.remove(anchor_id).is_some();
        if removed {
            info!(anchor_id, "Anchor deleted");
        }
        Ok(removed)
    }
}
