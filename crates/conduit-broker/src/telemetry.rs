//! Tracing setup for hosts embedding the broker.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! the host's decision.  [`init_tracing`] is the one-liner most hosts want.

use tracing_subscriber::EnvFilter;

/// Initialize a compact fmt subscriber filtered by `RUST_LOG`, falling back
/// to `default_level` when the variable is unset or invalid.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
