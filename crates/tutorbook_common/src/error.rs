// --- File: crates/tutorbook_common/src/error.rs ---
use std::fmt;
use thiserror::Error;

/// The base error type for all Tutorbook errors.
///
/// Each crate keeps its own domain error and implements `From<DomainError> for TutorbookError`
/// so handlers can return a single type.
#[derive(Error, Debug)]
pub enum TutorbookError {
    /// Error occurred while parsing data
    #[error("Failed to parse data: {0}")]
    ParseError(String),

    /// Error occurred due to missing or invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Caller identity is missing or malformed
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Caller is known but not allowed to touch the resource
    #[error("Forbidden: {0}")]
    ForbiddenError(String),

    /// Error occurred during validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Request is well-formed but violates a business rule
    #[error("Unprocessable: {0}")]
    UnprocessableError(String),

    /// Error occurred during database operation
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Error occurred during external service call
    #[error("External service error: {service_name} - {message}")]
    ExternalServiceError {
        service_name: String,
        message: String,
    },

    /// Error occurred due to a conflict (e.g., resource already taken)
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// The resource existed but is no longer usable
    #[error("Gone: {0}")]
    GoneError(String),

    /// Error occurred due to a resource not being found
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Error occurred due to an internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// A trait for converting errors to HTTP status codes.
pub trait HttpStatusCode {
    /// Returns the HTTP status code for this error.
    fn status_code(&self) -> u16;
}

impl HttpStatusCode for TutorbookError {
    fn status_code(&self) -> u16 {
        match self {
            TutorbookError::ParseError(_) => 400,
            TutorbookError::ConfigError(_) => 500,
            TutorbookError::AuthError(_) => 401,
            TutorbookError::ForbiddenError(_) => 403,
            TutorbookError::ValidationError(_) => 400,
            TutorbookError::UnprocessableError(_) => 422,
            TutorbookError::DatabaseError(_) => 500,
            TutorbookError::ExternalServiceError { .. } => 502,
            TutorbookError::ConflictError(_) => 409,
            TutorbookError::GoneError(_) => 410,
            TutorbookError::NotFoundError(_) => 404,
            TutorbookError::InternalError(_) => 500,
        }
    }
}

impl From<serde_json::Error> for TutorbookError {
    fn from(err: serde_json::Error) -> Self {
        TutorbookError::ParseError(err.to_string())
    }
}

// Utility functions for error handling
pub fn not_found<T: fmt::Display>(message: T) -> TutorbookError {
    TutorbookError::NotFoundError(message.to_string())
}

pub fn conflict<T: fmt::Display>(message: T) -> TutorbookError {
    TutorbookError::ConflictError(message.to_string())
}
