//! Error types for isolator operations

use std::io;

use thiserror::Error;

use crate::container::ContainerId;

/// Result type for isolator operations
pub type Result<T> = std::result::Result<T, IsolatorError>;

/// Errors that can occur during isolator operations
#[derive(Error, Debug)]
pub enum IsolatorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Container '{0}' has already been prepared")]
    AlreadyPrepared(ContainerId),

    #[error("Root cgroup '{0}' does not exist")]
    MissingRoot(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Invalid controller '{name}': {reason}")]
    InvalidController { name: String, reason: String },

    #[error("Failed to {operation} controllers: {}", .errors.join(", "))]
    ControllerFailures {
        operation: &'static str,
        errors: Vec<String>,
    },

    #[error("Failed to destroy cgroup '{cgroup}': {reason}")]
    DestroyFailed { cgroup: String, reason: String },

    #[error("Update is not supported for containers that share their parent's cgroup")]
    UpdateNotSupported,

    #[error("Unknown container '{0}'")]
    UnknownContainer(ContainerId),

    #[error("Container '{0}' is already being watched")]
    AlreadyWatched(ContainerId),

    #[error("Operation discarded")]
    Discarded,

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
