//! Service-level API
//!
//! `PositioningService` is the entry point for gateways (batch submission) and clients
//! (position, history and anchor queries).

pub mod service;
pub mod types;

pub use service::PositioningService;
pub use types::{AcceptanceStatus, ApiError, ApiResult, BatchAccepted, PositionResponse};
