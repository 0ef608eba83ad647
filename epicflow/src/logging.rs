//! Development-time tracing.
//!
//! Diagnostics go to stderr via `RUST_LOG` and are never persisted. The raw
//! agent stream for each step is a separate product artifact written under
//! `.epicflow/logs/` regardless of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` if unset. Output: stderr, compact.
///
/// ```bash
/// RUST_LOG=epicflow=debug epicflow run epics/2025-01-02-checkout
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
