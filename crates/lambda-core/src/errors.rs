//! Error types for the execution engine
//!
//! Failures are split by where they originate. `SandboxError` covers the
//! container runtime itself, `ExecutionError` is what a caller of the
//! dispatcher sees, and `ConfigError` is raised while loading settings.
//! The dispatcher folds sandbox failures into the execution taxonomy so that
//! infrastructure problems (staging, container supply) stay distinguishable
//! from failures of the user's own code.

use std::time::Duration;
use thiserror::Error;

/// Outcome classification for a single execution request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("No container available: {0}")]
    ContainerUnavailable(String),
    #[error("File copy failed: {0}")]
    StagingFailed(String),
    #[error("{0}")]
    RuntimeError(String),
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),
}

impl ExecutionError {
    /// Stable label used on the wire to tell failure classes apart.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Unauthorized => "unauthorized",
            ExecutionError::InvalidRequest(_) => "invalid_request",
            ExecutionError::ContainerUnavailable(_) => "container_unavailable",
            ExecutionError::StagingFailed(_) => "staging_failed",
            ExecutionError::RuntimeError(_) => "runtime_error",
            ExecutionError::Timeout(_) => "timeout",
        }
    }

    /// True when the failure is on our side rather than in the user's code.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ExecutionError::ContainerUnavailable(_) | ExecutionError::StagingFailed(_)
        )
    }
}

// Specific error for sandbox backends
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Bollard (Docker client) error: {0}")]
    Bollard(#[from] bollard::errors::Error),
    #[error("I/O error during sandbox operation: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Unknown container: {0}")]
    UnknownContainer(String),
    #[error("Sandbox backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
