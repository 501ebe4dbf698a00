//! Diagnostic logging initialization.
//!
//! The engine emits internal diagnostics through `tracing`; call one of
//! these once at startup to see them. The operational event log (the
//! `Trace` subsystem) is configured separately on the `Http` context.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with sensible defaults. The level is controlled
/// by `RUST_LOG`, defaulting to `info`.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize logging at a specific level, ignoring `RUST_LOG` unless
/// set.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
