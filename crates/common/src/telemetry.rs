//! Structured logging setup for processes embedding the pool

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Build the log filter: `LOG_LEVEL`, then `RUST_LOG`, then `default`.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global JSON subscriber.
///
/// Fails instead of panicking when a subscriber is already installed, so a
/// host application that configured its own tracing keeps it.
pub fn init(default: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(default))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(|e| Error::Telemetry(e.to_string()))
}
