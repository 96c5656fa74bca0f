use thiserror::Error;

/// Common error type for GpuSight components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown entity group: {0}")]
    UnknownEntityGroup(String),

    #[error("Unknown Prometheus type: {0}")]
    UnknownPromType(String),
}

/// Result type alias using GpuSight's Error.
pub type Result<T> = std::result::Result<T, Error>;
