//! Utility modules for configuration and monitoring

pub mod config;
pub mod monitor;

pub use config::{
    ConfigError, ConfigurationManager, CurrentPositionPolicy, ProcessingConfig, ServiceConfig,
    SolverConfig, StoreBackend, StoreConfig, ValidationConfig,
};
pub use monitor::{MetricsSnapshot, ProcessingMetrics};
