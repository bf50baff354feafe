//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from configuration load/save operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write a config file.
    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file contained invalid JSON.
    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A dot-path in a proposed config change did not resolve.
    #[error("Unknown config path: {0}")]
    UnknownPath(String),

    /// A proposed config value did not fit the schema.
    #[error("Invalid value for config path {path}: {source}")]
    InvalidValue {
        path: String,
        source: serde_json::Error,
    },
}
