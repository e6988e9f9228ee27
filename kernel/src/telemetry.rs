//! Structured log initialization for the worker and stress binaries.
//!
//! Library code logs through `tracing` with structured fields; the binary
//! picks the sink here. JSON lines by default so downstream collectors can
//! ingest worker output without a parsing step.

use tracing_subscriber::EnvFilter;

/// Initialize JSON-formatted tracing for a binary entrypoint.
///
/// Filtering comes from `RUST_LOG` with an info default. Safe to call once;
/// a second call is a no-op (the global default is already set).
pub fn init_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .try_init();
}

/// Human-readable tracing init, used by tests and local debugging.
pub fn init_pretty() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
