//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::infrastructure::config::LoggingConfig;

/// Initialize the global tracing subscriber. `RUST_LOG` overrides the
/// configured level. Safe to call once per process.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = fmt().with_env_filter(filter).with_target(false);
    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing init skipped: {e}");
    }
}
