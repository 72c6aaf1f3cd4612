// --- File: crates/tutorbook_payrexx/src/lib.rs ---
pub mod logic;
pub mod service;

pub use logic::{PayrexxClient, PayrexxError};
pub use service::PayrexxPaymentGateway;
