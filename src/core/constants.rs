//! Positioning constants and defaults

/// Minimum number of usable range measurements for a 3D fix
pub const MIN_MEASUREMENTS: usize = 3;

/// Default half-width of the solver search cube (meters per axis)
pub const DEFAULT_SEARCH_BOUND_M: f64 = 100.0;
