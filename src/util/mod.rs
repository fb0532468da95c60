//! Shared utilities.

pub mod clock;
pub mod telemetry;

pub use clock::{now_ms, now_secs_f64};
pub use telemetry::init_tracing;
