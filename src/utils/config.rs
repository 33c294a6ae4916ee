use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::DEFAULT_SEARCH_BOUND_M;

/// Service-wide configuration parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Trilateration solver settings
    pub solver: SolverConfig,
    /// Batch processing settings
    pub processing: ProcessingConfig,
    /// Structural validation limits for submitted batches
    pub validation: ValidationConfig,
    /// Position store backend and update policy
    pub store: StoreConfig,
}

/// Nonlinear least-squares solver parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Half-width of the search cube around the origin (meters per axis)
    pub search_bound_m: f64,
    /// Hard cap on solver iterations per tag
    pub max_iterations: usize,
    /// Relative step size below which the solve is considered converged
    pub step_tolerance: f64,
    /// Sum of squared residuals below which the solve is considered exact
    pub cost_tolerance: f64,
    /// Gradient infinity-norm below which the solve is considered converged
    pub gradient_tolerance: f64,
    /// Initial trust region radius (meters)
    pub initial_trust_radius_m: f64,
    /// Initial Levenberg damping
    pub initial_damping: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            search_bound_m: DEFAULT_SEARCH_BOUND_M,
            max_iterations: 200,
            step_tolerance: 1e-10,
            cost_tolerance: 1e-20,
            gradient_tolerance: 1e-14,
            initial_trust_radius_m: 10.0,
            initial_damping: 1e-3,
        }
    }
}

/// Batch processor and ingestion parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Solve the tags of one batch on the blocking pool in parallel
    pub parallel_tags: bool,
    /// Seed each solve with the tag's current position instead of the origin
    pub warm_start: bool,
    /// How long an active-anchor snapshot may be reused (0 disables caching)
    pub anchor_cache_ttl_ms: u64,
    /// Number of batches allowed in the processing stage at once
    pub max_concurrent_batches: usize,
    /// Number of batch statuses kept for lookup
    pub status_retention: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            parallel_tags: true,
            warm_start: false,
            anchor_cache_ttl_ms: 1000,
            max_concurrent_batches: 8,
            status_retention: 1024,
        }
    }
}

/// Limits applied when a batch is submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_measurements_per_batch: usize,
    /// Largest plausible range report (meters)
    pub max_distance_m: f64,
    pub max_identifier_len: usize,
    /// How far ahead of the server clock a batch timestamp may be
    pub max_future_skew_ms: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_measurements_per_batch: 10_000,
            max_distance_m: 1000.0,
            max_identifier_len: 128,
            max_future_skew_ms: 60_000,
        }
    }
}

/// Position store selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub current_position_policy: CurrentPositionPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sled { path: PathBuf },
}

/// How an incoming fix replaces a tag's stored current position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentPositionPolicy {
    /// Every successful commit overwrites, whatever the batch timestamps say
    #[default]
    LastWriteWins,
    /// A fix measured before the stored one is not written
    NewestMeasurementWins,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid parameter '{parameter}' = '{value}': {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("I/O error: {message}")]
    IoError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

/// Outcome of validating a configuration
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ConfigError>,
    pub warnings: Vec<String>,
}

/// Loads, validates and saves the service configuration
#[derive(Debug, Default)]
pub struct ConfigurationManager {
    config: ServiceConfig,
    config_file_path: Option<PathBuf>,
    is_modified: bool,
}

impl ConfigurationManager {
    /// Create a new configuration manager with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration manager and load from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut manager = Self::new();
        manager.load_from_file(path)?;
        Ok(manager)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Replace the configuration after validating it
    pub fn update(&mut self, config: ServiceConfig) -> Result<(), ConfigError> {
        Self::ensure_valid(self.validate(&config))?;
        self.config = config;
        self.is_modified = true;
        Ok(())
    }

    /// Load configuration from JSON file
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read config file '{}': {}", path_str, e),
        })?;

        let config: ServiceConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::SerializationError {
                message: format!("Failed to parse config file '{}': {}", path_str, e),
            })?;

        Self::ensure_valid(self.validate(&config))?;

        self.config = config;
        self.config_file_path = Some(path.as_ref().to_path_buf());
        self.is_modified = false;
        Ok(())
    }

    /// Save configuration to JSON file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let content = serde_json::to_string_pretty(&self.config).map_err(|e| {
            ConfigError::SerializationError {
                message: format!("Failed to serialize config: {}", e),
            }
        })?;

        fs::write(&path, content).map_err(|e| ConfigError::IoError {
            message: format!("Failed to write config file '{}': {}", path_str, e),
        })?;

        self.config_file_path = Some(path.as_ref().to_path_buf());
        self.is_modified = false;
        Ok(())
    }

    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.config_file_path.as_deref()
    }

    /// Check a configuration for values the service cannot run with
    pub fn validate(&self, config: &ServiceConfig) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let solver = &config.solver;
        if !(solver.search_bound_m.is_finite() && solver.search_bound_m > 0.0) {
            errors.push(invalid(
                "solver.search_bound_m",
                solver.search_bound_m,
                "Search bound must be a positive finite distance",
            ));
        }
        if solver.max_iterations == 0 {
            errors.push(invalid(
                "solver.max_iterations",
                solver.max_iterations,
                "Solver needs at least one iteration",
            ));
        }
        if !(solver.initial_trust_radius_m.is_finite() && solver.initial_trust_radius_m > 0.0) {
            errors.push(invalid(
                "solver.initial_trust_radius_m",
                solver.initial_trust_radius_m,
                "Trust radius must be a positive finite distance",
            ));
        }
        for (name, value) in [
            ("solver.step_tolerance", solver.step_tolerance),
            ("solver.cost_tolerance", solver.cost_tolerance),
            ("solver.gradient_tolerance", solver.gradient_tolerance),
            ("solver.initial_damping", solver.initial_damping),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                errors.push(invalid(name, value, "Must be a non-negative finite number"));
            }
        }
        if solver.max_iterations > 10_000 {
            warnings.push("Very high iteration cap lets a pathological tag stall its batch".to_string());
        }

        let processing = &config.processing;
        if processing.max_concurrent_batches == 0 {
            errors.push(invalid(
                "processing.max_concurrent_batches",
                processing.max_concurrent_batches,
                "At least one batch must be allowed to process",
            ));
        }
        if processing.status_retention == 0 {
            warnings.push("Batch statuses are pruned as soon as they complete".to_string());
        }

        let validation = &config.validation;
        if validation.max_measurements_per_batch == 0 {
            errors.push(invalid(
                "validation.max_measurements_per_batch",
                validation.max_measurements_per_batch,
                "Every batch would be rejected",
            ));
        }
        if !(validation.max_distance_m.is_finite() && validation.max_distance_m > 0.0) {
            errors.push(invalid(
                "validation.max_distance_m",
                validation.max_distance_m,
                "Distance limit must be a positive finite distance",
            ));
        }
        if validation.max_identifier_len == 0 {
            errors.push(invalid(
                "validation.max_identifier_len",
                validation.max_identifier_len,
                "Identifiers cannot be empty",
            ));
        }

        if let StoreBackend::Sled { path } = &config.store.backend {
            if path.as_os_str().is_empty() {
                errors.push(invalid("store.backend.path", "", "Sled store needs a directory"));
            }
        }

        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn ensure_valid(result: ValidationResult) -> Result<(), ConfigError> {
        match result.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn invalid(parameter: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidParameter {
        parameter: parameter.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
