//! Error types for the fiscal compliance orchestrator

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Errors
    // =============================

    /// Bad or missing rule data. Fatal at load, never retried.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Malformed input to a computation.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A collaborator call failed. Stages may retry these locally.
    #[error("External dependency error: {0}")]
    ExternalDependencyError(String),

    #[error("State conflict: {0}")]
    StateConflictError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Coarse classification kept on a failed pipeline context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Validation,
    ExternalDependency,
    StateConflict,
    NotFound,
    Internal,
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::ConfigurationError(_) => ErrorKind::Configuration,
            OrchestrationError::ValidationError(_) => ErrorKind::Validation,
            OrchestrationError::ExternalDependencyError(_) | OrchestrationError::HttpError(_) => {
                ErrorKind::ExternalDependency
            }
            OrchestrationError::StateConflictError(_) => ErrorKind::StateConflict,
            OrchestrationError::NotFound(_) => ErrorKind::NotFound,
            OrchestrationError::AuditError(_)
            | OrchestrationError::SerializationError(_)
            | OrchestrationError::IoError(_) => ErrorKind::Internal,
        }
    }

    /// Whether a stage may retry the failed call.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::ExternalDependency
    }
}
