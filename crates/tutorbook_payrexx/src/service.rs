// --- File: crates/tutorbook_payrexx/src/service.rs ---
use tracing::debug;
use tutorbook_common::services::{
    BoxFuture, CheckoutOutcome, CheckoutRequest, CheckoutSession, PaymentGateway,
};
use tutorbook_config::PayrexxConfig;

use crate::logic::{outcome_from_status, session_from_gateway, PayrexxClient, PayrexxError};

/// Payrexx implementation of the payment gateway.
pub struct PayrexxPaymentGateway {
    client: PayrexxClient,
}

impl PayrexxPaymentGateway {
    pub fn new(config: &PayrexxConfig) -> Result<Self, PayrexxError> {
        Ok(Self {
            client: PayrexxClient::from_config(config)?,
        })
    }
}

impl PaymentGateway for PayrexxPaymentGateway {
    type Error = PayrexxError;

    fn create_checkout(
        &self,
        request: CheckoutRequest,
    ) -> BoxFuture<'_, CheckoutSession, Self::Error> {
        Box::pin(async move {
            let gateway = self.client.create_gateway(&request).await?;
            session_from_gateway(gateway)
        })
    }

    fn cancel_checkout(&self, link_id: &str) -> BoxFuture<'_, (), Self::Error> {
        let link_id = link_id.to_string();
        Box::pin(async move { self.client.delete_gateway(&link_id).await })
    }

    fn checkout_status(&self, link_id: &str) -> BoxFuture<'_, CheckoutOutcome, Self::Error> {
        let link_id = link_id.to_string();
        Box::pin(async move {
            let gateway = self.client.retrieve_gateway(&link_id).await?;
            let status = gateway.status.unwrap_or_default();
            debug!("Payrexx gateway {} is {}", link_id, status);
            Ok(outcome_from_status(&status))
        })
    }
}
