//! Error types for the slot store

use thiserror::Error;
use tutorbook_common::TutorbookError;

/// Errors that can occur when working with the store
#[derive(Debug, Error)]
pub enum DbError {
    /// Error from SQLx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Error with the database configuration
    #[error("Database configuration error: {0}")]
    ConfigError(String),

    /// Error with database pool creation
    #[error("Database pool error: {0}")]
    PoolError(String),

    /// Error with database query
    #[error("Database query error: {0}")]
    QueryError(String),

    /// Error with database transaction
    #[error("Database transaction error: {0}")]
    TransactionError(String),

    /// A persisted value could not be mapped back to a record
    #[error("Failed to decode {entity} row: {message}")]
    DecodeError { entity: &'static str, message: String },

    /// A write targeted a row the transaction never locked
    #[error("{entity} {id} was written without holding its row lock")]
    NotLocked { entity: &'static str, id: String },

    /// A write targeted a row that does not exist
    #[error("{entity} {id} not found")]
    MissingRow { entity: &'static str, id: String },
}

impl DbError {
    pub fn not_locked(entity: &'static str, id: impl ToString) -> Self {
        DbError::NotLocked {
            entity,
            id: id.to_string(),
        }
    }

    pub fn missing(entity: &'static str, id: impl ToString) -> Self {
        DbError::MissingRow {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<DbError> for TutorbookError {
    fn from(err: DbError) -> Self {
        TutorbookError::DatabaseError(err.to_string())
    }
}
