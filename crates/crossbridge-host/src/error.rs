use std::path::PathBuf;

use thiserror::Error;

/// Failures of the host itself, as opposed to a bridge call.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}
