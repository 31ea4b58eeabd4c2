//! Error types for the database layer.

use renderflow_protocol::EngineError;
use thiserror::Error;

/// Database operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Insert violating a model invariant
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Constraint violation (unique, foreign key, etc.)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a constraint error.
    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether the failure is worth retrying (pool exhaustion, lock
    /// contention, I/O hiccups).
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Sqlx(sqlx::Error::PoolTimedOut) => true,
            DbError::Sqlx(sqlx::Error::Io(_)) => true,
            DbError::Sqlx(sqlx::Error::Database(db)) => {
                let message = db.message().to_lowercase();
                message.contains("locked") || message.contains("busy")
            }
            _ => false,
        }
    }
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => EngineError::NotFound(what),
            DbError::Validation(msg) => EngineError::Validation(msg),
            DbError::InvalidState(msg) => EngineError::Conflict(msg),
            DbError::Constraint(msg) => EngineError::Validation(msg),
            other if other.is_transient() => EngineError::TransientStore(other.to_string()),
            other => EngineError::Internal(other.to_string()),
        }
    }
}
