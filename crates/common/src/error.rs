//! Configuration and setup errors shared by every crate

use thiserror::Error;

/// Errors raised while loading configuration or wiring up process state.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Telemetry setup failed: {0}")]
    Telemetry(String),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
