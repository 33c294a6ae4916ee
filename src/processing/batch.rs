//! Batch processing: group by tag, solve each tag, commit each result
//!
//! A batch never fails because of one tag. Every tag either ends in `positioned` or in
//! `failures` of the returned [`BatchReport`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::algorithms::{TrilaterationEngine, TrilaterationSolution};
use crate::core::{AnchorSnapshot, BatchId, CalculatedPosition, CurrentPosition, Measurement, MeasurementBatch, Point3};
use crate::processing::cache::AnchorSnapshotCache;
use crate::storage::{PositionStore, UpsertOutcome};
use crate::utils::config::ProcessingConfig;
use crate::utils::monitor::ProcessingMetrics;
use crate::validation::error::{TagError, TrilaterationError};

/// Why a tag in a batch produced no position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagFailure {
    pub tag_id: String,
    /// Stable label, see [`TagError::kind`]
    pub kind: String,
    pub message: String,
}

impl TagFailure {
    fn new(tag_id: &str, error: &TagError) -> Self {
        Self {
            tag_id: tag_id.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Outcome of processing one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub gateway_id: String,
    /// Tags that got a new history row, sorted
    pub positioned: Vec<String>,
    pub failures: Vec<TagFailure>,
    /// Set when the anchor snapshot could not be fetched and no tag was attempted
    pub registry_error: Option<String>,
}

/// Partition measurements by tag. Order inside each group follows the batch.
pub fn group_by_tag(measurements: Vec<Measurement>) -> BTreeMap<String, Vec<Measurement>> {
    let mut groups: BTreeMap<String, Vec<Measurement>> = BTreeMap::new();
    for measurement in measurements {
        groups.entry(measurement.tag_id.clone()).or_default().push(measurement);
    }
    groups
}

/// Runs the grouping / trilateration / persistence protocol for accepted batches
pub struct BatchProcessor {
    anchors: Arc<AnchorSnapshotCache>,
    pipeline: TagPipeline,
    parallel_tags: bool,
}

/// Solve-and-commit for one tag; cloned into the task that runs it
#[derive(Clone)]
struct TagPipeline {
    engine: Arc<TrilaterationEngine>,
    store: Arc<dyn PositionStore>,
    metrics: Arc<ProcessingMetrics>,
    warm_start: bool,
    offload_solve: bool,
}

struct TagJob {
    batch_id: BatchId,
    tag_id: String,
    measurements: Vec<Measurement>,
    snapshot: Arc<AnchorSnapshot>,
    measured_at: DateTime<Utc>,
}

impl BatchProcessor {
    pub fn new(
        engine: TrilaterationEngine,
        anchors: Arc<AnchorSnapshotCache>,
        store: Arc<dyn PositionStore>,
        metrics: Arc<ProcessingMetrics>,
        config: ProcessingConfig,
    ) -> Self {
        Self {
            anchors,
            pipeline: TagPipeline {
                engine: Arc::new(engine),
                store,
                metrics,
                warm_start: config.warm_start,
                offload_solve: config.parallel_tags,
            },
            parallel_tags: config.parallel_tags,
        }
    }

    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.pipeline.store
    }

    /// Process one accepted batch to completion
    pub async fn process(&self, batch_id: BatchId, batch: MeasurementBatch) -> BatchReport {
        let MeasurementBatch {
            gateway_id,
            timestamp,
            measurements,
        } = batch;
        let groups = group_by_tag(measurements);
        let metrics = &self.pipeline.metrics;

        let mut report = BatchReport {
            batch_id,
            gateway_id,
            positioned: Vec::new(),
            failures: Vec::new(),
            registry_error: None,
        };

        // One snapshot for the whole batch
        let snapshot = match self.anchors.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(batch_id = %batch_id, error = %err, "Anchor snapshot unavailable, batch not processed");
                report.registry_error = Some(err.to_string());
                for tag_id in groups.keys() {
                    let tag_error = TagError::Registry(err.clone());
                    metrics.record_tag_failure(&tag_error);
                    report.failures.push(TagFailure::new(tag_id, &tag_error));
                }
                return report;
            }
        };

        debug!(batch_id = %batch_id, tags = groups.len(), active_anchors = snapshot.len(), "Processing batch");

        let jobs = groups.into_iter().map(|(tag_id, measurements)| TagJob {
            batch_id,
            tag_id,
            measurements,
            snapshot: Arc::clone(&snapshot),
            measured_at: timestamp,
        });

        // Each tag runs in its own task so a panic fails that tag only
        let mut outcomes = Vec::new();
        if self.parallel_tags {
            let handles: Vec<_> = jobs
                .map(|job| (job.tag_id.clone(), tokio::spawn(self.pipeline.clone().run(job))))
                .collect();
            for (tag_id, handle) in handles {
                outcomes.push((tag_id, flatten_join(handle.await)));
            }
        } else {
            for job in jobs {
                let tag_id = job.tag_id.clone();
                let joined = tokio::spawn(self.pipeline.clone().run(job)).await;
                outcomes.push((tag_id, flatten_join(joined)));
            }
        }

        for (tag_id, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    metrics.record_tag_positioned();
                    report.positioned.push(tag_id);
                }
                Err(err) => {
                    warn!(batch_id = %batch_id, tag_id = %tag_id, kind = err.kind(), error = %err, "Tag not positioned");
                    metrics.record_tag_failure(&err);
                    report.failures.push(TagFailure::new(&tag_id, &err));
                }
            }
        }

        info!(
            batch_id = %batch_id,
            gateway_id = %report.gateway_id,
            positioned = report.positioned.len(),
            failed = report.failures.len(),
            "Batch processed"
        );
        report
    }
}

fn flatten_join(joined: Result<Result<(), TagError>, JoinError>) -> Result<(), TagError> {
    match joined {
        Ok(outcome) => outcome,
        Err(join_error) => Err(TagError::Internal(format!("tag task failed: {}", join_error))),
    }
}

impl TagPipeline {
    async fn run(self, job: TagJob) -> Result<(), TagError> {
        let prior = self.initial_guess(&job.tag_id).await;

        let solution = if self.offload_solve {
            let engine = Arc::clone(&self.engine);
            let metrics = Arc::clone(&self.metrics);
            let snapshot = Arc::clone(&job.snapshot);
            let measurements = job.measurements;
            tokio::task::spawn_blocking(move || solve_timed(&engine, &metrics, &measurements, &snapshot, prior))
                .await
                .map_err(|e| TagError::Internal(format!("solver task failed: {}", e)))??
        } else {
            solve_timed(&self.engine, &self.metrics, &job.measurements, &job.snapshot, prior)?
        };

        self.commit(job.batch_id, &job.tag_id, job.measured_at, &solution).await
    }

    async fn initial_guess(&self, tag_id: &str) -> Option<Point3> {
        if !self.warm_start {
            return None;
        }
        match self.store.get_current_position(tag_id).await {
            Ok(current) => current.map(|c| c.position),
            Err(err) => {
                debug!(tag_id, error = %err, "No warm start, current position unavailable");
                None
            }
        }
    }

    /// Persist the history row, then the current position
    async fn commit(
        &self,
        batch_id: BatchId,
        tag_id: &str,
        measured_at: DateTime<Utc>,
        solution: &TrilaterationSolution,
    ) -> Result<(), TagError> {
        let record = CalculatedPosition {
            batch_id,
            tag_id: tag_id.to_string(),
            position: solution.position,
            accuracy: solution.accuracy,
            calculated_at: Utc::now(),
        };
        let current = CurrentPosition::from_calculated(&record, measured_at);

        self.store.record_calculated_position(record).await?;
        let outcome = self.store.upsert_current_position(current).await?;

        debug!(
            batch_id = %batch_id,
            tag_id,
            x = solution.position.x,
            y = solution.position.y,
            z = solution.position.z,
            accuracy = solution.accuracy,
            anchors = solution.anchors_used,
            iterations = solution.iterations,
            converged = solution.converged,
            kept_existing = outcome == UpsertOutcome::KeptExisting,
            "Tag positioned"
        );
        Ok(())
    }
}

fn solve_timed(
    engine: &TrilaterationEngine,
    metrics: &ProcessingMetrics,
    measurements: &[Measurement],
    snapshot: &AnchorSnapshot,
    prior: Option<Point3>,
) -> Result<TrilaterationSolution, TrilaterationError> {
    let started = Instant::now();
    let result = engine.solve(measurements, snapshot, prior);
    if !matches!(result, Err(TrilaterationError::InsufficientMeasurements { .. })) {
        metrics.record_solve_time(started.elapsed());
    }
    result
}
