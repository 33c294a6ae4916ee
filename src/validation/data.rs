use chrono::{DateTime, Utc};

use crate::core::MeasurementBatch;
use crate::utils::config::ValidationConfig;
use crate::validation::error::ValidationError;

/// Structural checks applied before a batch is accepted
///
/// Anchor existence and activity are deliberately not checked here; measurements against
/// unknown or inactive anchors are filtered later by the trilateration engine.
#[derive(Debug, Clone, Default)]
pub struct BatchValidator {
    config: ValidationConfig,
}

impl BatchValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn validate(&self, batch: &MeasurementBatch) -> Result<(), ValidationError> {
        self.validate_at(batch, Utc::now())
    }

    /// Validate against an explicit server clock
    pub fn validate_at(&self, batch: &MeasurementBatch, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let gateway_id = batch.gateway_id.trim();
        if gateway_id.is_empty() {
            return Err(ValidationError::InvalidGatewayId {
                reason: "empty".to_string(),
            });
        }
        if gateway_id.len() > self.config.max_identifier_len {
            return Err(ValidationError::InvalidGatewayId {
                reason: format!("longer than {} bytes", self.config.max_identifier_len),
            });
        }

        let skew_ms = (batch.timestamp - now).num_milliseconds();
        if skew_ms > self.config.max_future_skew_ms {
            return Err(ValidationError::TimestampInFuture { skew_ms });
        }

        if batch.measurements.is_empty() {
            return Err(ValidationError::EmptyMeasurements);
        }
        if batch.measurements.len() > self.config.max_measurements_per_batch {
            return Err(ValidationError::TooManyMeasurements {
                count: batch.measurements.len(),
                max: self.config.max_measurements_per_batch,
            });
        }

        for (index, measurement) in batch.measurements.iter().enumerate() {
            self.check_identifier(index, "anchor_id", &measurement.anchor_id)?;
            self.check_identifier(index, "tag_id", &measurement.tag_id)?;

            let distance = measurement.distance_m;
            let problem = if !distance.is_finite() {
                Some("not a finite number".to_string())
            } else if distance < 0.0 {
                Some("negative".to_string())
            } else if distance > self.config.max_distance_m {
                Some(format!("exceeds {} m", self.config.max_distance_m))
            } else {
                None
            };
            if let Some(reason) = problem {
                return Err(ValidationError::InvalidDistance {
                    index,
                    value: distance,
                    reason,
                });
            }
        }

        Ok(())
    }

    fn check_identifier(&self, index: usize, field: &str, value: &str) -> Result<(), ValidationError> {
        let reason = if value.trim().is_empty() {
            "empty".to_string()
        } else if value.chars().any(char::is_control) {
            "contains control characters".to_string()
        } else if value.len() > self.config.max_identifier_len {
            format!("longer than {} bytes", self.config.max_identifier_len)
        } else {
            return Ok(());
        };

        Err(ValidationError::InvalidIdentifier {
            index,
            field: field.to_string(),
            reason,
        })
    }
}
