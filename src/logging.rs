//! Named log sinks
//!
//! The core writes to three category targets plus a `symbol` field on per-symbol
//! lines. Where the lines end up is decided by whatever subscriber the binary
//! installs.

use tracing_subscriber::EnvFilter;

/// Lifecycle and pipeline progress
pub const MAIN: &str = "fxbot::main";
/// Every failure, whatever its severity
pub const ERROR: &str = "fxbot::error";
/// Per-signal order processing detail
pub const TRADE_PROCESSOR: &str = "fxbot::trade_processor";

pub const DEFAULT_FILTER: &str = "fxbot=info";

/// Install the global subscriber. `RUST_LOG` wins over `filter` when set.
pub fn setup_logging(filter: Option<&str>, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_FILTER)));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
