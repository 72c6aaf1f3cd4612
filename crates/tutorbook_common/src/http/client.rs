// --- File: crates/tutorbook_common/src/http/client.rs ---
use once_cell::sync::Lazy;
use reqwest::{Client, Error as ReqwestError};
use std::time::Duration;

/// Default timeout for outbound requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Shared client for outbound calls to external collaborators.
pub static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    create_client(DEFAULT_TIMEOUT_SECS, true).unwrap_or_else(|err| {
        tracing::error!("Failed to build configured HTTP client, using defaults: {}", err);
        Client::new()
    })
});

/// Creates a new HTTP client with a custom timeout and redirect policy.
pub fn create_client(timeout_secs: u64, follow_redirects: bool) -> Result<Client, ReqwestError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .redirect(if follow_redirects {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        })
        .build()
}
