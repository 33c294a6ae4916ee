use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::AnchorSnapshot;
use crate::registry::AnchorRegistry;
use crate::validation::error::RegistryError;

/// Short-lived cache of the active-anchor snapshot
///
/// A batch takes one snapshot and positions all of its tags against it. Consecutive
/// batches within `expiration` share the same snapshot.
pub struct AnchorSnapshotCache {
    registry: Arc<dyn AnchorRegistry>,
    /// Cache expiration time
    expiration: Duration,
    cached: Mutex<Option<(Instant, Arc<AnchorSnapshot>)>>,
    /// Cache hit count for statistics
    hit_count: AtomicU64,
    /// Cache miss count for statistics
    miss_count: AtomicU64,
}

impl AnchorSnapshotCache {
    pub fn new(registry: Arc<dyn AnchorRegistry>, expiration: Duration) -> Self {
        Self {
            registry,
            expiration,
            cached: Mutex::new(None),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    /// Create a cache with expiration given in milliseconds (0 disables caching)
    pub fn with_expiration_ms(registry: Arc<dyn AnchorRegistry>, expiration_ms: u64) -> Self {
        Self::new(registry, Duration::from_millis(expiration_ms))
    }

    pub fn registry(&self) -> &Arc<dyn AnchorRegistry> {
        &self.registry
    }

    /// Current snapshot, fetched from the registry when missing or expired
    pub async fn snapshot(&self) -> Result<Arc<AnchorSnapshot>, RegistryError> {
        if let Some(snapshot) = self.fresh() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(snapshot);
        }

        self.miss_count.fetch_add(1, Ordering::Relaxed);
        let snapshot = Arc::new(self.registry.list_active_anchors().await?);
        debug!(active_anchors = snapshot.len(), "Anchor snapshot refreshed");

        if !self.expiration.is_zero() {
            if let Ok(mut cached) = self.cached.lock() {
                *cached = Some((Instant::now(), Arc::clone(&snapshot)));
            }
        }
        Ok(snapshot)
    }

    /// Drop the cached snapshot so the next batch refetches
    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }

    /// Get cache statistics as (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hit_count.load(Ordering::Relaxed),
            self.miss_count.load(Ordering::Relaxed),
        )
    }

    fn fresh(&self) -> Option<Arc<AnchorSnapshot>> {
        let cached = self.cached.lock().ok()?;
        match cached.as_ref() {
            Some((taken, snapshot)) if taken.elapsed() < self.expiration => Some(Arc::clone(snapshot)),
            _ => None,
        }
    }
}
