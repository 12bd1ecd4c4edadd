//! Error types for the Turbo attribute cache
//!
//! The cache operations themselves never fail: provider failures are
//! absorbed at the chain boundary. Only construction, configuration and
//! the statistics log can surface an [`Error`].

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or tearing down a cache
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// The prefetch worker thread could not be started
    #[error("Failed to spawn prefetch worker '{name}': {source}")]
    WorkerSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The statistics log could not be opened or written
    #[error("Statistics log error for {path}: {source}")]
    StatisticsLog {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
