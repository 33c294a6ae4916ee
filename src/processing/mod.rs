//! Batch ingestion and per-tag processing

pub mod batch;
pub mod cache;
pub mod ingest;

pub use batch::{group_by_tag, BatchProcessor, BatchReport, TagFailure};
pub use cache::AnchorSnapshotCache;
pub use ingest::{BatchAck, BatchStatus, MeasurementIngestor};
