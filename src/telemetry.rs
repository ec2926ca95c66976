//! Logging initialization.
//!
//! All diagnostics go through `tracing`. The subscriber writes to stderr so
//! command output on stdout stays machine-readable.
//!
//! Filtering:
//! - `RUST_LOG` is honored when set.
//! - Otherwise the default is `warn`, raised to `info` for this crate.
//! - `GT_DEBUG_SESSION=1` raises the session engine to `debug`; the
//!   non-fatal diagnostics the engine otherwise swallows.
//! - `RUST_LOG_FORMAT=json` switches to the JSON formatter.

use tracing_subscriber::EnvFilter;

/// Initialize the stderr tracing subscriber. Call once from `main`.
///
/// Safe to call when a subscriber is already set (later calls are no-ops),
/// which keeps tests that initialize logging independent.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut directives = "warn,rigtown=info".to_owned();
        if std::env::var("GT_DEBUG_SESSION").is_ok_and(|v| !v.is_empty() && v != "0") {
            directives.push_str(",rigtown::session=debug");
        }
        EnvFilter::new(directives)
    });

    let json = std::env::var("RUST_LOG_FORMAT").is_ok_and(|v| v == "json");
    if json {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
