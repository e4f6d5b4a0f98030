//! Storage error taxonomy

use thiserror::Error;

/// Errors from repository operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// Referenced row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent writers collided (e.g. run-number assignment); retry
    #[error("conflict: {0}")]
    Conflict(String),

    /// Stored data could not be decoded into the domain model
    #[error("invalid stored data: {0}")]
    Invalid(String),

    /// Serialization of a domain value failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        StorageError::NotFound(format!("{entity} {id}"))
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        StorageError::Conflict(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        StorageError::Invalid(msg.into())
    }

    /// True when the caller should retry the operation
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}
