//! Tracing setup.
//!
//! All log output goes to stderr so that JSON written to stdout by CLI
//! commands stays machine-readable. `RUST_LOG` overrides the configured
//! level.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the global subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_ansi(atty::is(atty::Stream::Stderr)),
            )
            .try_init()
    };

    if installed.is_ok() {
        tracing::debug!(level = %config.level, json = config.json, "logging initialized");
    }
    Ok(())
}

/// Initialize logging for tests (captured by the test harness).
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
