//! Core data types for the positioning service

use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Cartesian point in the site frame (meters)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn origin() -> Self {
        Self::default()
    }

    pub fn to_vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn from_vector(v: &Vector3<f64>) -> Self {
        Self { x: v.x, y: v.y, z: v.z }
    }

    pub fn distance_to(&self, other: &Point3) -> f64 {
        (self.to_vector() - other.to_vector()).norm()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Fixed radio beacon registered with the anchor registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub anchor_id: String,
    #[serde(flatten)]
    pub position: Point3,
    pub is_active: bool,
    #[serde(default)]
    pub last_calibration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Anchor {
    pub fn new(anchor_id: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            position: Point3::new(x, y, z),
            is_active: true,
            last_calibration: None,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Positions of the active anchors, taken once per batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnchorSnapshot {
    anchors: HashMap<String, Point3>,
    taken_at: DateTime<Utc>,
}

impl AnchorSnapshot {
    pub fn new(anchors: HashMap<String, Point3>) -> Self {
        Self {
            anchors,
            taken_at: Utc::now(),
        }
    }

    /// Build a snapshot from registry rows, keeping only active anchors.
    pub fn from_anchors<'a>(anchors: impl IntoIterator<Item = &'a Anchor>) -> Self {
        Self::new(
            anchors
                .into_iter()
                .filter(|a| a.is_active)
                .map(|a| (a.anchor_id.clone(), a.position))
                .collect(),
        )
    }

    pub fn get(&self, anchor_id: &str) -> Option<&Point3> {
        self.anchors.get(anchor_id)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

/// Single range report: distance from one anchor to one tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub anchor_id: String,
    pub tag_id: String,
    pub distance_m: f64,
}

impl Measurement {
    pub fn new(anchor_id: impl Into<String>, tag_id: impl Into<String>, distance_m: f64) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            tag_id: tag_id.into(),
            distance_m,
        }
    }
}

/// One gateway submission, possibly covering several tags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementBatch {
    pub gateway_id: String,
    pub timestamp: DateTime<Utc>,
    pub measurements: Vec<Measurement>,
}

/// Opaque identifier assigned to a batch on acceptance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchId {
    fn from(id: Uuid) -> Self {
        BatchId(id)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Append-only history row, one per successful per-tag solve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedPosition {
    pub batch_id: BatchId,
    pub tag_id: String,
    #[serde(flatten)]
    pub position: Point3,
    /// Worst absolute residual at the solution (meters)
    pub accuracy: f64,
    pub calculated_at: DateTime<Utc>,
}

/// Latest known position of a tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPosition {
    pub tag_id: String,
    #[serde(flatten)]
    pub position: Point3,
    pub accuracy: f64,
    /// Timestamp declared by the gateway batch the fix came from
    pub measured_at: DateTime<Utc>,
    pub calculated_at: DateTime<Utc>,
    pub batch_id: BatchId,
}

impl CurrentPosition {
    pub fn from_calculated(record: &CalculatedPosition, measured_at: DateTime<Utc>) -> Self {
        Self {
            tag_id: record.tag_id.clone(),
            position: record.position,
            accuracy: record.accuracy,
            measured_at,
            calculated_at: record.calculated_at,
            batch_id: record.batch_id,
        }
    }
}
