// --- File: crates/tutorbook_common/src/lib.rs ---

pub mod error; // Error handling
pub mod http; // HTTP utilities
pub mod logging; // Logging utilities
pub mod models; // Slot, plan, payment, package, refund and wallet records
pub mod services; // Service abstractions

// Re-export error types and utilities for easier access
pub use error::{conflict, not_found, HttpStatusCode, TutorbookError};

// Re-export HTTP utilities for easier access
pub use http::client::{create_client, HTTP_CLIENT};

// Re-export logging utilities for easier access
pub use logging::{init, init_with_level, log_result};
