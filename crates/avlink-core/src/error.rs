//! Domain-specific error types following panic-free policy.

use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by an external collaborator (video provider, avatar
/// application, overlay-network directory).
#[derive(Error, Debug, Clone)]
pub enum CollaboratorError {
    /// The collaborator could not be reached or did not respond
    #[error("{collaborator} unavailable: {reason}")]
    Unavailable {
        collaborator: &'static str,
        reason: String,
    },

    /// The collaborator answered but the operation failed
    #[error("{collaborator} failed to {operation}: {reason}")]
    OperationFailed {
        collaborator: &'static str,
        operation: &'static str,
        reason: String,
    },

    /// The collaborator produced output that could not be interpreted
    #[error("{collaborator} returned malformed output: {reason}")]
    Malformed {
        collaborator: &'static str,
        reason: String,
    },
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Invalid config file {path}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Result type for collaborator operations.
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;
