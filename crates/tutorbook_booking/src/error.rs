// --- File: crates/tutorbook_booking/src/error.rs ---
use thiserror::Error;
use tutorbook_common::models::SlotId;
use tutorbook_common::{HttpStatusCode, TutorbookError};
use tutorbook_db::DbError;

/// Errors of the reservation engine.
///
/// Every variant except `Gateway` and `Store` is a rule violation detected before anything was
/// written; the transaction it happened in is dropped, so nothing it staged becomes visible.
#[derive(Debug, Error)]
pub enum BookingError {
    #[error("Slot {0} is not available")]
    SlotUnavailable(SlotId),

    #[error("Hold on slot {0} has expired")]
    SlotExpired(SlotId),

    #[error("Package has {remaining} slot(s) left but {requested} were requested")]
    QuotaExceeded { requested: usize, remaining: i32 },

    #[error("Not allowed: {0}")]
    Unauthorized(String),

    #[error("Tutor {0} is not approved yet")]
    TutorNotApproved(String),

    #[error("Tutor {0} is suspended")]
    TutorSuspended(String),

    #[error("A pending refund request already exists for slot {0}")]
    DuplicateRefund(SlotId),

    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("Plans may cover at most {max} distinct weekdays")]
    MaxWeeklyDaysExceeded { max: usize },

    #[error("Booking time conflict: {0}")]
    BookingTimeConflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("External service failed: {0}")]
    Gateway(String),

    #[error(transparent)]
    Store(#[from] DbError),
}

impl BookingError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        BookingError::Unauthorized(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        BookingError::InvalidRequest(message.into())
    }

    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        BookingError::NotFound(format!("{} {}", entity, id))
    }
}

impl HttpStatusCode for BookingError {
    fn status_code(&self) -> u16 {
        match self {
            BookingError::SlotUnavailable(_) => 409,
            BookingError::SlotExpired(_) => 410,
            BookingError::QuotaExceeded { .. } => 422,
            BookingError::Unauthorized(_) => 403,
            BookingError::TutorNotApproved(_) | BookingError::TutorSuspended(_) => 403,
            BookingError::DuplicateRefund(_) => 409,
            BookingError::InvalidTimeRange(_) => 400,
            BookingError::MaxWeeklyDaysExceeded { .. } => 422,
            BookingError::BookingTimeConflict(_) => 409,
            BookingError::InvalidRequest(_) => 400,
            BookingError::NotFound(_) => 404,
            BookingError::Gateway(_) => 502,
            BookingError::Store(_) => 500,
        }
    }
}

impl From<BookingError> for TutorbookError {
    fn from(err: BookingError) -> Self {
        let message = err.to_string();
        match err.status_code() {
            400 => TutorbookError::ValidationError(message),
            403 => TutorbookError::ForbiddenError(message),
            404 => TutorbookError::NotFoundError(message),
            409 => TutorbookError::ConflictError(message),
            410 => TutorbookError::GoneError(message),
            422 => TutorbookError::UnprocessableError(message),
            502 => TutorbookError::ExternalServiceError {
                service_name: "booking".to_string(),
                message,
            },
            _ => match err {
                BookingError::Store(db) => db.into(),
                _ => TutorbookError::InternalError(message),
            },
        }
    }
}
