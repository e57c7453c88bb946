//! # hearth-logging
//!
//! `tracing` subscriber setup for processes embedding the storage core, plus
//! an in-memory capture layer for asserting on log output in tests.
//!
//! The storage core logs under these targets:
//! - `hearth_storage::sql`: every statement, its bound values and timing (debug)
//! - `hearth_storage::txn`: transaction start/end/retry/failure
//! - `hearth_storage::perf`: periodic database-time reports (info)

#![deny(unsafe_code)]

pub mod capture;

pub use capture::{CapturedEvent, CapturedLogs, capture_logs};

use hearth_settings::LoggingSettings;

/// Initialize the global tracing subscriber with stderr output.
///
/// `RUST_LOG` takes precedence over `level`. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // set_global_default is a no-op if already set
    let _ = subscriber.try_init();
}

/// Initialize the global subscriber with JSON lines on stderr.
pub fn init_json_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .json()
        .try_init();
}

/// Initialize the global subscriber from loaded settings.
pub fn init_from_settings(settings: &LoggingSettings) {
    init_subscriber(&settings.level);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
