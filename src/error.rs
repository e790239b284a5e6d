//! Error types for the Guardian service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Guardian operations.
#[derive(Error, Debug)]
pub enum GuardianError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A request the engine cannot evaluate
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GuardianError {
    fn from(err: config::ConfigError) -> Self {
        GuardianError::Config(err.to_string())
    }
}

/// Result type alias for Guardian operations.
pub type Result<T> = std::result::Result<T, GuardianError>;
