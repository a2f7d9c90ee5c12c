//! Tracing/logging initialization.
//!
//! JSON lines on stdout, filtered by `RUST_LOG`. Job and stage code attaches
//! `job_id`, `kind`, `worker` and `stage` fields, so the output can be joined
//! per job downstream.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Build the filter from `RUST_LOG`, falling back to `default_directive`.
pub fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the JSON subscriber.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(default_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(true)
        .with_target(false)
        .try_init()
        .is_ok()
}
