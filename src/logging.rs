//! Log subscriber setup.
//!
//! The server logs through `tracing` with structured fields. Under
//! systemd the subscriber writes straight to journald; anywhere else it
//! falls back to a compact stdout format filtered by `RUST_LOG`
//! (default INFO).

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

/// Install the global subscriber. Called once at startup.
pub fn init() {
    // JOURNAL_STREAM is set by systemd when stdout/stderr are connected
    // to the journal.
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
            return;
        }
    }

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
