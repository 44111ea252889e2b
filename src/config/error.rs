//! Configuration error types

use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
}

/// Errors that can occur during configuration validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid port number")]
    InvalidPort,

    #[error("Maximum message size must be non-zero")]
    InvalidMessageSize,

    #[error("Capacity for '{0}' must be non-zero")]
    InvalidCapacity(&'static str),

    #[error("Timeout '{0}' must be non-zero")]
    InvalidTimeout(&'static str),
}
