//! Structured logging setup.
//!
//! `RUST_LOG` wins over the configured level so operators can raise
//! verbosity for one module without editing the config file.

#[cfg(feature = "telemetry")]
use std::sync::Once;

#[cfg(feature = "telemetry")]
static INIT: Once = Once::new();

/// Install the global tracing subscriber. Later calls are no-ops.
#[cfg(feature = "telemetry")]
pub fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .try_init();
    });
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_default_level: &str) {}

/// Whether `level` is accepted by [`init_tracing`].
pub fn is_valid_level(level: &str) -> bool {
    matches!(
        level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    )
}
