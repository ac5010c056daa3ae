//! Logging setup
//!
//! Every crate logs through `tracing` under the `dormant::*` targets:
//!
//! | target | events |
//! |---|---|
//! | `dormant::session` | lifecycle operations, transactions |
//! | `dormant::flush` | dirty checks, statement execution |
//! | `dormant::cache` | put-from-load decisions, invalidations |
//! | `dormant::store` | statements seen by the in-memory store |
//!
//! These helpers install a `tracing-subscriber` fmt subscriber. Without the
//! `logging` feature they do nothing and the application brings its own
//! subscriber.

#[cfg(feature = "logging")]
use tracing_subscriber::{fmt, EnvFilter};

/// Install a subscriber at `info`
///
/// `RUST_LOG` overrides the level when set.
#[cfg(feature = "logging")]
pub fn init() {
    init_with_level("info")
}

/// Install a subscriber at `level` (trace, debug, info, warn, error)
///
/// `RUST_LOG` overrides the level when set. Does nothing if a global
/// subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("dormant={}", level)));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init();
}

/// Install a debug-level subscriber writing through the test harness
#[cfg(feature = "logging")]
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("dormant=debug"))
        .with_test_writer()
        .try_init();
}

/// Install a subscriber at `info` (no-op without the `logging` feature)
#[cfg(not(feature = "logging"))]
pub fn init() {}

/// Install a subscriber at `level` (no-op without the `logging` feature)
#[cfg(not(feature = "logging"))]
pub fn init_with_level(_level: &str) {}

/// Install a test subscriber (no-op without the `logging` feature)
#[cfg(not(feature = "logging"))]
pub fn init_test() {}
