//! Structured logging with `tracing`.
//!
//! - [`init_subscriber`] installs the global stderr subscriber, compact or JSON
//! - [`capture_logs`] installs a thread-local capturing subscriber for tests
//!
//! Engine code logs through `tracing` macros with structured fields
//! (`peer`, `code`, `delay_ms`, `discriminator`, …); nothing in the engine
//! installs a subscriber on its own.

pub mod capture;

pub use capture::{LogRecord, LogSink, capture_logs};

/// Initialize the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` wins over `level` when set. Subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - Default filter directive, e.g. `"info"` or `"chatwire_realtime=debug"`.
/// * `json` - Emit one JSON object per line instead of compact text.
pub fn init_subscriber(level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init is a no-op if a global subscriber is already set
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}
