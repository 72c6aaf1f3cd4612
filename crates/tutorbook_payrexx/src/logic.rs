// --- File: crates/tutorbook_payrexx/src/logic.rs ---

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap; // ordered params for signing
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tutorbook_common::services::{CheckoutOutcome, CheckoutRequest, CheckoutSession};
use tutorbook_common::HTTP_CLIENT;
use tutorbook_config::{PayrexxConfig, SECRET_MARKER};

// Signature generation imports
use base64::{engine::general_purpose::STANDARD as base64_engine, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const DEFAULT_API_BASE_URL: &str = "https://api.payrexx.com/v1.0";
const DEFAULT_CURRENCY: &str = "CHF";

// --- Error Handling ---
#[derive(Error, Debug)]
pub enum PayrexxError {
    #[error("Payrexx API request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Payrexx API returned an error: Status={status}, Message='{message}'")]
    ApiError { status: String, message: String },
    #[error("Failed to parse Payrexx API response: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Payrexx configuration missing or incomplete: {0}")]
    ConfigError(String),
    #[error("Failed to encode request body: {0}")]
    EncodingError(String),
    #[error("Internal processing error: {0}")]
    InternalError(String),
}

// --- Structures for Payrexx API Response ---
#[derive(Deserialize, Debug, Clone)]
pub struct PayrexxGatewayData {
    pub id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Deserialize, Debug)]
struct PayrexxApiResponse {
    status: String,
    #[serde(default)]
    data: Vec<PayrexxGatewayData>,
    message: Option<String>,
}

/// Generates the HMAC-SHA256 signature required by the Payrexx API (base64 encoded).
pub fn generate_payrexx_signature(
    query_string: &str,
    api_secret: &str,
) -> Result<String, PayrexxError> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .map_err(|e| PayrexxError::InternalError(format!("invalid signing key: {}", e)))?;
    mac.update(query_string.as_bytes());
    Ok(base64_engine.encode(mac.finalize().into_bytes()))
}

/// Converts a decimal amount to the integer minor units Payrexx expects (cents/rappen).
pub fn to_minor_units(amount: Decimal) -> Result<i64, PayrexxError> {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .filter(|cents| *cents > 0)
        .ok_or_else(|| PayrexxError::EncodingError(format!("unsupported amount {}", amount)))
}

/// Maps a Payrexx gateway status onto the checkout outcome the engine understands.
pub fn outcome_from_status(status: &str) -> CheckoutOutcome {
    match status {
        "confirmed" | "authorized" => CheckoutOutcome::Paid,
        "cancelled" | "declined" | "error" => CheckoutOutcome::Cancelled,
        "expired" => CheckoutOutcome::Expired,
        _ => CheckoutOutcome::Pending,
    }
}

/// Signed access to the Payrexx Gateway endpoints of one instance.
#[derive(Debug, Clone)]
pub struct PayrexxClient {
    config: PayrexxConfig,
    api_secret: String,
    base_url: String,
}

impl PayrexxClient {
    /// Builds a client from config. The secret comes from `payrexx.api_secret`, falling back to
    /// the `PAYREXX_API_SECRET` environment variable.
    pub fn from_config(config: &PayrexxConfig) -> Result<Self, PayrexxError> {
        let api_secret = config
            .api_secret
            .clone()
            .filter(|secret| !secret.is_empty() && secret != SECRET_MARKER)
            .or_else(|| std::env::var("PAYREXX_API_SECRET").ok())
            .ok_or_else(|| PayrexxError::ConfigError("api secret is not set".to_string()))?;
        if config.instance_name.is_empty() {
            return Err(PayrexxError::ConfigError("instance_name is empty".to_string()));
        }
        let base_url = config
            .api_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            config: config.clone(),
            api_secret,
            base_url,
        })
    }

    fn gateway_url(&self, gateway_id: Option<&str>) -> String {
        match gateway_id {
            Some(id) => format!(
                "{}/Gateway/{}/?instance={}",
                self.base_url, id, self.config.instance_name
            ),
            None => format!("{}/Gateway/?instance={}", self.base_url, self.config.instance_name),
        }
    }

    /// Url-encodes `params`, signs the encoding and returns the final body with `ApiSignature`.
    fn signed_form(&self, mut params: BTreeMap<String, String>) -> Result<String, PayrexxError> {
        let query_string_for_sig = serde_urlencoded::to_string(&params).map_err(|e| {
            PayrexxError::EncodingError(format!("Failed to urlencode params for signature: {}", e))
        })?;
        let api_signature = generate_payrexx_signature(&query_string_for_sig, &self.api_secret)?;
        params.insert("ApiSignature".to_string(), api_signature);
        serde_urlencoded::to_string(&params).map_err(|e| {
            PayrexxError::EncodingError(format!("Failed to urlencode final params: {}", e))
        })
    }

    /// Creates a payment gateway (checkout link) for one local payment.
    pub async fn create_gateway(
        &self,
        request: &CheckoutRequest,
    ) -> Result<PayrexxGatewayData, PayrexxError> {
        let mut form_params: BTreeMap<String, String> = BTreeMap::new();
        form_params.insert("amount".to_string(), to_minor_units(request.amount)?.to_string());
        form_params.insert(
            "currency".to_string(),
            self.config
                .currency
                .clone()
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        );
        form_params.insert("purpose".to_string(), request.description.clone());
        form_params.insert("referenceId".to_string(), request.reference.clone());
        form_params.insert("validity".to_string(), request.expires_in_minutes.to_string());
        form_params.insert(
            "successRedirectUrl".to_string(),
            request
                .return_url
                .clone()
                .unwrap_or_else(|| self.config.success_url.clone()),
        );
        form_params.insert("failedRedirectUrl".to_string(), self.config.failed_url.clone());
        form_params.insert(
            "cancelRedirectUrl".to_string(),
            request
                .cancel_url
                .clone()
                .unwrap_or_else(|| self.config.cancel_url.clone()),
        );

        let body = self.signed_form(form_params)?;
        let api_url = self.gateway_url(None);
        debug!("Creating Payrexx gateway for payment {}", request.reference);

        let response = HTTP_CLIENT
            .post(&api_url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await?;

        let gateway = parse_gateway_response(response).await?;
        info!(
            "Payrexx gateway {} created for payment {}",
            gateway.id, request.reference
        );
        Ok(gateway)
    }

    /// Reads the current state of a gateway.
    pub async fn retrieve_gateway(
        &self,
        gateway_id: &str,
    ) -> Result<PayrexxGatewayData, PayrexxError> {
        let signature = generate_payrexx_signature("", &self.api_secret)?;
        let signature_param = serde_urlencoded::to_string(&[("ApiSignature", signature.as_str())])
            .map_err(|e| PayrexxError::EncodingError(e.to_string()))?;
        let api_url = format!("{}&{}", self.gateway_url(Some(gateway_id)), signature_param);
        let response = HTTP_CLIENT.get(&api_url).send().await?;
        parse_gateway_response(response).await
    }

    /// Deletes a gateway so its link can no longer be paid. A gateway Payrexx no longer knows
    /// about counts as deleted.
    pub async fn delete_gateway(&self, gateway_id: &str) -> Result<(), PayrexxError> {
        let body = self.signed_form(BTreeMap::new())?;
        let response = HTTP_CLIENT
            .delete(self.gateway_url(Some(gateway_id)))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!("Payrexx gateway {} was already gone", gateway_id);
            return Ok(());
        }
        parse_gateway_response(response).await?;
        info!("Payrexx gateway {} deleted", gateway_id);
        Ok(())
    }
}

async fn parse_gateway_response(
    response: reqwest::Response,
) -> Result<PayrexxGatewayData, PayrexxError> {
    let status = response.status();
    let body_text = response.text().await?;

    if !status.is_success() {
        error!(
            "Payrexx API request failed with HTTP status: {}. Body: {}",
            status, body_text
        );
        let message = match serde_json::from_str::<PayrexxApiResponse>(&body_text) {
            Ok(err_resp) => err_resp.message.unwrap_or(body_text),
            Err(_) => body_text,
        };
        return Err(PayrexxError::ApiError {
            status: status.to_string(),
            message,
        });
    }

    let payrexx_response: PayrexxApiResponse = serde_json::from_str(&body_text)?;
    if payrexx_response.status != "success" {
        let message = payrexx_response
            .message
            .unwrap_or_else(|| "Unknown Payrexx API error".to_string());
        error!(
            "Payrexx API reported error. Status: {}, Message: {}",
            payrexx_response.status, message
        );
        return Err(PayrexxError::ApiError {
            status: payrexx_response.status,
            message,
        });
    }

    payrexx_response.data.into_iter().next().ok_or_else(|| {
        PayrexxError::InternalError("Payrexx response missing gateway data".to_string())
    })
}

/// Turns created gateway data into the session handed back to the engine.
pub fn session_from_gateway(gateway: PayrexxGatewayData) -> Result<CheckoutSession, PayrexxError> {
    let checkout_url = gateway.link.ok_or_else(|| {
        PayrexxError::InternalError("Payrexx response missing gateway link".to_string())
    })?;
    Ok(CheckoutSession {
        link_id: gateway.id.to_string(),
        checkout_url,
        qr_url: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_signature_is_base64_hmac() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let signature =
            generate_payrexx_signature("The quick brown fox jumps over the lazy dog", "key")
                .unwrap();
        assert_eq!(signature, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(dec!(50.00)).unwrap(), 5000);
        assert_eq!(to_minor_units(dec!(12.345)).unwrap(), 1234);
        assert!(to_minor_units(dec!(0)).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(outcome_from_status("confirmed"), CheckoutOutcome::Paid);
        assert_eq!(outcome_from_status("waiting"), CheckoutOutcome::Pending);
        assert_eq!(outcome_from_status("declined"), CheckoutOutcome::Cancelled);
        assert_eq!(outcome_from_status("expired"), CheckoutOutcome::Expired);
    }
}
