//! Tunnel error types

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("The ssh client is not installed on the system")]
    ClientUnavailable,

    #[error("No available services")]
    NoServiceAvailable,

    #[error("The tunnel URL is not found (service: {service})")]
    UrlNotFound {
        service: String,
        /// Everything the subprocess printed before it went away
        output: String,
    },

    #[error("Failed to spawn ssh process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Invalid URL pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to read service table {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse service table {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl TunnelError {
    /// Returns true for the one failure the engine recovers from by picking
    /// another service.
    pub fn is_url_not_found(&self) -> bool {
        matches!(self, TunnelError::UrlNotFound { .. })
    }
}
