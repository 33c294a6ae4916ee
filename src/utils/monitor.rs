//! Processing counters for the ingestion pipeline

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::validation::error::{TagError, TrilaterationError};

/// Lock-free counters shared by the ingestor and the batch processor
#[derive(Debug, Default)]
pub struct ProcessingMetrics {
    batches_accepted: AtomicU64,
    batches_rejected: AtomicU64,
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    tags_positioned: AtomicU64,
    insufficient_measurements: AtomicU64,
    solver_divergence: AtomicU64,
    storage_errors: AtomicU64,
    registry_errors: AtomicU64,
    internal_errors: AtomicU64,
    solve_time_us: AtomicU64,
    solves: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batches_accepted: u64,
    pub batches_rejected: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub tags_positioned: u64,
    pub insufficient_measurements: u64,
    pub solver_divergence: u64,
    pub storage_errors: u64,
    pub registry_errors: u64,
    pub internal_errors: u64,
    /// Mean wall time of one trilateration solve (microseconds)
    pub avg_solve_time_us: f64,
}

impl MetricsSnapshot {
    pub fn tag_failures(&self) -> u64 {
        self.insufficient_measurements
            + self.solver_divergence
            + self.storage_errors
            + self.registry_errors
            + self.internal_errors
    }
}

impl ProcessingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch_accepted(&self) {
        self.batches_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_completed(&self) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tag_positioned(&self) {
        self.tags_positioned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_solve_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.solve_time_us.fetch_add(micros, Ordering::Relaxed);
        self.solves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tag_failure(&self, error: &TagError) {
        let counter = match error {
            TagError::Trilateration(TrilaterationError::InsufficientMeasurements { .. }) => {
                &self.insufficient_measurements
            }
            TagError::Trilateration(TrilaterationError::SolverDivergence { .. }) => &self.solver_divergence,
            TagError::Storage(_) => &self.storage_errors,
            TagError::Registry(_) => &self.registry_errors,
            TagError::Internal(_) => &self.internal_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let solves = self.solves.load(Ordering::Relaxed);
        let avg_solve_time_us = if solves > 0 {
            self.solve_time_us.load(Ordering::Relaxed) as f64 / solves as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            batches_accepted: self.batches_accepted.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            tags_positioned: self.tags_positioned.load(Ordering::Relaxed),
            insufficient_measurements: self.insufficient_measurements.load(Ordering::Relaxed),
            solver_divergence: self.solver_divergence.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            registry_errors: self.registry_errors.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
            avg_solve_time_us,
        }
    }
}
