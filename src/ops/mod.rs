//! Operations and observability.
//!
//! - [`observability`] - Labelled metrics registry and storage metrics
//! - [`telemetry`] - Tracing subscriber setup

pub mod observability;
pub mod telemetry;

pub use observability::{MetricsRegistry, StoreMetrics};
