//! Measurement ingestion: synchronous admission, asynchronous processing

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::core::{BatchId, MeasurementBatch};
use crate::processing::batch::BatchProcessor;
use crate::utils::config::ProcessingConfig;
use crate::utils::monitor::ProcessingMetrics;
use crate::validation::{BatchValidator, ValidationError};

/// Lifecycle of an accepted batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    /// Processed; per-tag failures are counted, not fatal
    Completed { positioned: usize, failed: usize },
    /// No tag could be attempted
    Failed { reason: String },
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed { .. } | BatchStatus::Failed { .. })
    }
}

/// Returned as soon as a batch is accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: BatchId,
    pub status: BatchStatus,
}

/// Tracked batch statuses, oldest first for pruning
struct StatusBook {
    statuses: DashMap<BatchId, watch::Receiver<BatchStatus>>,
    order: Mutex<VecDeque<BatchId>>,
    retention: usize,
}

impl StatusBook {
    fn new(retention: usize) -> Self {
        Self {
            statuses: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    fn track(&self, batch_id: BatchId, rx: watch::Receiver<BatchStatus>) {
        self.statuses.insert(batch_id, rx);
        if let Ok(mut order) = self.order.lock() {
            order.push_back(batch_id);
        }
        self.prune();
    }

    /// Drop the oldest finished entries until the book fits its retention
    fn prune(&self) {
        let Ok(mut order) = self.order.lock() else {
            return;
        };
        if order.len() <= self.retention {
            return;
        }

        let mut excess = order.len() - self.retention;
        order.retain(|batch_id| {
            if excess == 0 {
                return true;
            }
            let terminal = self
                .statuses
                .get(batch_id)
                .map(|rx| rx.borrow().is_terminal())
                .unwrap_or(true);
            if terminal {
                self.statuses.remove(batch_id);
                excess -= 1;
            }
            !terminal
        });
    }

    fn receiver(&self, batch_id: &BatchId) -> Option<watch::Receiver<BatchStatus>> {
        self.statuses.get(batch_id).map(|rx| rx.clone())
    }

    fn len(&self) -> usize {
        self.statuses.len()
    }
}

/// Accepts measurement batches and hands them to the [`BatchProcessor`] in the background
pub struct MeasurementIngestor {
    validator: BatchValidator,
    processor: Arc<BatchProcessor>,
    metrics: Arc<ProcessingMetrics>,
    book: Arc<StatusBook>,
    permits: Arc<Semaphore>,
}

impl MeasurementIngestor {
    pub fn new(
        validator: BatchValidator,
        processor: Arc<BatchProcessor>,
        metrics: Arc<ProcessingMetrics>,
        config: &ProcessingConfig,
    ) -> Self {
        Self {
            validator,
            processor,
            metrics,
            book: Arc::new(StatusBook::new(config.status_retention)),
            permits: Arc::new(Semaphore::new(config.max_concurrent_batches.max(1))),
        }
    }

    /// Validate and accept a batch. Processing continues after this returns.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, batch: MeasurementBatch) -> Result<BatchAck, ValidationError> {
        if let Err(err) = self.validator.validate(&batch) {
            self.metrics.record_batch_rejected();
            warn!(gateway_id = %batch.gateway_id, error = %err, "Batch rejected");
            return Err(err);
        }

        let batch_id = BatchId::new();
        let (tx, rx) = watch::channel(BatchStatus::Queued);
        self.book.track(batch_id, rx);
        self.metrics.record_batch_accepted();

        info!(
            batch_id = %batch_id,
            gateway_id = %batch.gateway_id,
            measurements = batch.measurements.len(),
            "Batch accepted"
        );

        let processor = Arc::clone(&self.processor);
        let metrics = Arc::clone(&self.metrics);
        let permits = Arc::clone(&self.permits);
        let book = Arc::clone(&self.book);

        tokio::spawn(async move {
            // Closed only if the ingestor is torn down; process anyway
            let _permit = permits.acquire_owned().await.ok();
            tx.send_replace(BatchStatus::Processing);

            let report = processor.process(batch_id, batch).await;
            let status = match report.registry_error {
                Some(reason) => {
                    metrics.record_batch_failed();
                    BatchStatus::Failed { reason }
                }
                None => {
                    metrics.record_batch_completed();
                    BatchStatus::Completed {
                        positioned: report.positioned.len(),
                        failed: report.failures.len(),
                    }
                }
            };
            debug!(batch_id = %batch_id, status = ?status, "Batch finished");
            tx.send_replace(status);
            book.prune();
        });

        Ok(BatchAck {
            batch_id,
            status: BatchStatus::Queued,
        })
    }

    /// Latest known status, `None` for unknown or pruned batches
    pub fn status(&self, batch_id: BatchId) -> Option<BatchStatus> {
        self.book.receiver(&batch_id).map(|rx| rx.borrow().clone())
    }

    /// Wait until the batch reaches a terminal status
    pub async fn wait_for_completion(&self, batch_id: BatchId) -> Option<BatchStatus> {
        let mut rx = self.book.receiver(&batch_id)?;
        let status = match rx.wait_for(BatchStatus::is_terminal).await {
            Ok(status) => status.clone(),
            Err(_) => BatchStatus::Failed {
                reason: "batch task ended without a result".to_string(),
            },
        };
        Some(status)
    }

    /// Number of batch statuses currently tracked
    pub fn tracked_batches(&self) -> usize {
        self.book.len()
    }
}
