//! Development-time tracing for debugging the supervisor.
//!
//! Tracing is dev diagnostics via `RUST_LOG`, output to stderr, not
//! persisted. The progress log (`io::progress`) is the product audit trail
//! and is always written regardless of this.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber. Reads `RUST_LOG`, defaults to `warn`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
