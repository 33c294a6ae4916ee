//! Data validation and error types

pub mod data;
pub mod error;

pub use data::BatchValidator;
pub use error::{RegistryError, StorageError, TagError, TrilaterationError, ValidationError};
