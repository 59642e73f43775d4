//! Error types for the atomic operations pipeline

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, AtomicOpsError>;

#[derive(Error, Debug)]
pub enum AtomicOpsError {

    // =============================
    // Oracle Errors
    // =============================

    /// Transport or availability failure. Callers degrade to fallback.
    #[error("Oracle error: {0}")]
    OracleError(String),

    /// Reply did not match the call site's contract (missing key, value outside the taxonomy).
    #[error("Invalid oracle response: {0}")]
    InvalidOracleResponse(String),

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(Uuid),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AtomicOpsError {
    /// True for failures the classifier, decomposer and intent layer absorb
    /// by switching to their deterministic path.
    pub fn is_oracle_failure(&self) -> bool {
        matches!(
            self,
            AtomicOpsError::OracleError(_)
                | AtomicOpsError::InvalidOracleResponse(_)
                | AtomicOpsError::HttpError(_)
        )
    }
}
