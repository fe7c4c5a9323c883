//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// No container runtime available.
    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation did not finish within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fragments of runtime stderr that indicate a failure worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "temporarily unavailable",
    "connection refused",
    "connection reset",
    "cannot connect to the docker daemon",
    "resource temporarily",
    "try again",
];

impl ContainerError {
    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ContainerError::Timeout(_) | ContainerError::Io(_) => true,
            ContainerError::CommandFailed { message, .. } => {
                let lower = message.to_lowercase();
                TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::ContainerNotFound(_))
    }
}
