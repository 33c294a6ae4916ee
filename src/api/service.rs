//! Service facade tying ingestion, registry and store together

use std::sync::Arc;
use tracing::{info, warn};

use crate::algorithms::TrilaterationEngine;
use crate::api::types::{ApiError, ApiResult, BatchAccepted, PositionResponse};
use crate::core::{Anchor, BatchId, CalculatedPosition, MeasurementBatch};
use crate::processing::{AnchorSnapshotCache, BatchProcessor, BatchStatus, MeasurementIngestor};
use crate::registry::AnchorRegistry;
use crate::storage::{open_store, PositionStore};
use crate::utils::config::{ConfigurationManager, ServiceConfig};
use crate::utils::monitor::{MetricsSnapshot, ProcessingMetrics};
use crate::validation::BatchValidator;

/// Positioning service
///
/// Gateways submit measurement batches; clients read current positions and history.
/// Must be used from within a Tokio runtime.
pub struct PositioningService {
    config: ServiceConfig,
    registry: Arc<dyn AnchorRegistry>,
    anchors: Arc<AnchorSnapshotCache>,
    store: Arc<dyn PositionStore>,
    metrics: Arc<ProcessingMetrics>,
    ingestor: MeasurementIngestor,
}

impl PositioningService {
    /// Build the service, opening the store backend named in `config`
    pub fn from_config(config: ServiceConfig, registry: Arc<dyn AnchorRegistry>) -> ApiResult<Self> {
        let store = open_store(&config.store)?;
        Self::with_store(config, registry, store)
    }

    /// Build the service on an already opened store
    pub fn with_store(
        config: ServiceConfig,
        registry: Arc<dyn AnchorRegistry>,
        store: Arc<dyn PositionStore>,
    ) -> ApiResult<Self> {
        let checked = ConfigurationManager::new().validate(&config);
        for warning in &checked.warnings {
            warn!(%warning, "Configuration warning");
        }
        if let Some(err) = checked.errors.into_iter().next() {
            return Err(err.into());
        }

        let metrics = Arc::new(ProcessingMetrics::new());
        let anchors = Arc::new(AnchorSnapshotCache::with_expiration_ms(
            Arc::clone(&registry),
            config.processing.anchor_cache_ttl_ms,
        ));
        let processor = Arc::new(BatchProcessor::new(
            TrilaterationEngine::new(config.solver.clone()),
            Arc::clone(&anchors),
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.processing.clone(),
        ));
        let ingestor = MeasurementIngestor::new(
            BatchValidator::new(config.validation.clone()),
            processor,
            Arc::clone(&metrics),
            &config.processing,
        );

        info!(
            search_bound_m = config.solver.search_bound_m,
            parallel_tags = config.processing.parallel_tags,
            policy = ?config.store.current_position_policy,
            "Positioning service ready"
        );

        Ok(Self {
            config,
            registry,
            anchors,
            store,
            metrics,
            ingestor,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Accept a batch for background processing
    pub fn submit_batch(&self, batch: MeasurementBatch) -> ApiResult<BatchAccepted> {
        let ack = self.ingestor.submit(batch)?;
        Ok(BatchAccepted::new(ack.batch_id))
    }

    pub fn batch_status(&self, batch_id: BatchId) -> ApiResult<BatchStatus> {
        self.ingestor
            .status(batch_id)
            .ok_or_else(|| ApiError::not_found("batch", batch_id.to_string()))
    }

    /// Resolve once the batch is completed or failed
    pub async fn wait_for_batch(&self, batch_id: BatchId) -> ApiResult<BatchStatus> {
        self.ingestor
            .wait_for_completion(batch_id)
            .await
            .ok_or_else(|| ApiError::not_found("batch", batch_id.to_string()))
    }

    pub async fn current_position(&self, tag_id: &str) -> ApiResult<PositionResponse> {
        self.store
            .get_current_position(tag_id)
            .await?
            .map(PositionResponse::from)
            .ok_or_else(|| ApiError::not_found("tag", tag_id))
    }

    pub async fn list_current_positions(&self) -> ApiResult<Vec<PositionResponse>> {
        let positions = self.store.list_current_positions().await?;
        Ok(positions.into_iter().map(PositionResponse::from).collect())
    }

    /// Fix history of a tag, newest first
    pub async fn tag_history(&self, tag_id: &str, limit: Option<usize>) -> ApiResult<Vec<CalculatedPosition>> {
        Ok(self.store.history_for_tag(tag_id, limit).await?)
    }

    /// Forget the tag's current position; its history stays
    pub async fn remove_tag(&self, tag_id: &str) -> ApiResult<()> {
        if self.store.remove_tag(tag_id).await? {
            info!(tag_id, "Tag removed");
            Ok(())
        } else {
            Err(ApiError::not_found("tag", tag_id))
        }
    }

    pub async fn list_anchors(&self) -> ApiResult<Vec<Anchor>> {
        Ok(self.registry.list_anchors().await?)
    }

    pub async fn get_anchor(&self, anchor_id: &str) -> ApiResult<Anchor> {
        self.registry
            .get_anchor(anchor_id)
            .await?
            .ok_or_else(|| ApiError::not_found("anchor", anchor_id))
    }

    /// Delete an anchor; batches accepted afterwards no longer see it
    pub async fn delete_anchor(&self, anchor_id: &str) -> ApiResult<()> {
        if !self.registry.delete_anchor(anchor_id).await? {
            return Err(ApiError::not_found("anchor", anchor_id));
        }
        self.anchors.invalidate();
        info!(anchor_id, "Anchor deleted");
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
