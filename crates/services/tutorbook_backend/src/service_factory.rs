// --- File: crates/services/tutorbook_backend/src/service_factory.rs ---
//! Service factory implementation.
//!
//! Decides, from the application configuration, which collaborator implementations the
//! engine runs against and erases their error types to [`BoxedError`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tutorbook_common::services::{
    BoxFuture, BoxedError, CheckoutOutcome, CheckoutRequest, CheckoutSession, IdentityDirectory,
    Notification, NotificationService, PaymentGateway, PayoutLedger, RefundPayout,
    ServiceFactory, TutorStanding,
};
use tutorbook_config::{AppConfig, IdentityConfig};
use tutorbook_payrexx::PayrexxPaymentGateway;

/// Wraps a gateway so it can be used where the error type is [`BoxedError`].
struct BoxedPaymentGateway<G> {
    inner: G,
}

impl<G: PaymentGateway> PaymentGateway for BoxedPaymentGateway<G> {
    type Error = BoxedError;

    fn create_checkout(
        &self,
        request: CheckoutRequest,
    ) -> BoxFuture<'_, CheckoutSession, Self::Error> {
        Box::pin(async move {
            self.inner
                .create_checkout(request)
                .await
                .map_err(BoxedError::new)
        })
    }

    fn cancel_checkout(&self, link_id: &str) -> BoxFuture<'_, (), Self::Error> {
        let link_id = link_id.to_string();
        Box::pin(async move {
            self.inner
                .cancel_checkout(&link_id)
                .await
                .map_err(BoxedError::new)
        })
    }

    fn checkout_status(&self, link_id: &str) -> BoxFuture<'_, CheckoutOutcome, Self::Error> {
        let link_id = link_id.to_string();
        Box::pin(async move {
            self.inner
                .checkout_status(&link_id)
                .await
                .map_err(BoxedError::new)
        })
    }
}

/// Gateway used when Payrexx is disabled. Links never settle on their own; payments only
/// complete through the signed webhook.
#[derive(Default)]
pub struct LocalPaymentGateway {
    next_link: AtomicU64,
}

impl PaymentGateway for LocalPaymentGateway {
    type Error = BoxedError;

    fn create_checkout(
        &self,
        request: CheckoutRequest,
    ) -> BoxFuture<'_, CheckoutSession, Self::Error> {
        Box::pin(async move {
            let n = self.next_link.fetch_add(1, Ordering::SeqCst) + 1;
            let link_id = format!("local-{}", n);
            info!(
                "Local checkout {} for payment {} over {}",
                link_id, request.reference, request.amount
            );
            Ok(CheckoutSession {
                checkout_url: format!("local://checkout/{}", link_id),
                qr_url: None,
                link_id,
            })
        })
    }

    fn cancel_checkout(&self, link_id: &str) -> BoxFuture<'_, (), Self::Error> {
        info!("Local checkout {} cancelled", link_id);
        Box::pin(async { Ok(()) })
    }

    fn checkout_status(&self, _link_id: &str) -> BoxFuture<'_, CheckoutOutcome, Self::Error> {
        Box::pin(async { Ok(CheckoutOutcome::Pending) })
    }
}

/// Writes notifications to the log.
pub struct LoggingNotifier;

impl NotificationService for LoggingNotifier {
    type Error = BoxedError;

    fn notify(&self, notification: Notification) -> BoxFuture<'_, (), Self::Error> {
        Box::pin(async move {
            info!(
                "Notify {}: {} - {}",
                notification.user_id, notification.subject, notification.body
            );
            Ok(())
        })
    }
}

/// Tutor standing and admin membership from the `identity` section.
pub struct StaticIdentityDirectory {
    approve_all: bool,
    approved: HashSet<String>,
    suspended: HashSet<String>,
    admins: HashSet<String>,
}

impl StaticIdentityDirectory {
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            approve_all: config.approve_all,
            approved: config.approved_tutors.iter().cloned().collect(),
            suspended: config.suspended_tutors.iter().cloned().collect(),
            admins: config.admins.iter().cloned().collect(),
        }
    }

    fn standing(&self, tutor_id: &str) -> TutorStanding {
        if self.suspended.contains(tutor_id) {
            TutorStanding::Suspended
        } else if self.approve_all || self.approved.contains(tutor_id) {
            TutorStanding::Approved
        } else {
            TutorStanding::NotApproved
        }
    }
}

impl IdentityDirectory for StaticIdentityDirectory {
    type Error = BoxedError;

    fn tutor_standing(&self, tutor_id: &str) -> BoxFuture<'_, TutorStanding, Self::Error> {
        let standing = self.standing(tutor_id);
        Box::pin(async move { Ok(standing) })
    }

    fn is_admin(&self, user_id: &str) -> BoxFuture<'_, bool, Self::Error> {
        let admin = self.admins.contains(user_id);
        Box::pin(async move { Ok(admin) })
    }
}

/// Hands approved refunds to the payout team through the log.
pub struct LoggingPayoutLedger;

impl PayoutLedger for LoggingPayoutLedger {
    type Error = BoxedError;

    fn record_refund_payout(&self, payout: RefundPayout) -> BoxFuture<'_, (), Self::Error> {
        Box::pin(async move {
            info!(
                "Refund {} approved: pay {} to {} ({:?})",
                payout.refund_id, payout.amount, payout.learner_id, payout.bank.account_holder
            );
            Ok(())
        })
    }
}

pub struct TutorbookServiceFactory {
    payment_gateway: Arc<dyn PaymentGateway<Error = BoxedError>>,
    notification_service: Arc<dyn NotificationService<Error = BoxedError>>,
    identity_directory: Arc<dyn IdentityDirectory<Error = BoxedError>>,
    payout_ledger: Arc<dyn PayoutLedger<Error = BoxedError>>,
}

impl TutorbookServiceFactory {
    /// Builds the factory. Payrexx is used when `use_payrexx` is set and its section is
    /// complete; otherwise checkouts stay local.
    pub fn new(config: &AppConfig) -> Self {
        let payment_gateway: Arc<dyn PaymentGateway<Error = BoxedError>> =
            match (config.use_payrexx, config.payrexx.as_ref()) {
                (true, Some(payrexx)) => match PayrexxPaymentGateway::new(payrexx) {
                    Ok(gateway) => {
                        info!("Payrexx gateway enabled for instance {}", payrexx.instance_name);
                        Arc::new(BoxedPaymentGateway { inner: gateway })
                    }
                    Err(e) => {
                        warn!("Payrexx is enabled but unusable ({}); using local checkouts", e);
                        Arc::new(LocalPaymentGateway::default())
                    }
                },
                (true, None) => {
                    warn!("use_payrexx is set without a payrexx section; using local checkouts");
                    Arc::new(LocalPaymentGateway::default())
                }
                (false, _) => {
                    info!("Payrexx disabled; using local checkouts");
                    Arc::new(LocalPaymentGateway::default())
                }
            };

        Self {
            payment_gateway,
            notification_service: Arc::new(LoggingNotifier),
            identity_directory: Arc::new(StaticIdentityDirectory::new(&config.identity)),
            payout_ledger: Arc::new(LoggingPayoutLedger),
        }
    }
}

impl ServiceFactory for TutorbookServiceFactory {
    fn payment_gateway(&self) -> Arc<dyn PaymentGateway<Error = BoxedError>> {
        self.payment_gateway.clone()
    }

    fn notification_service(&self) -> Arc<dyn NotificationService<Error = BoxedError>> {
        self.notification_service.clone()
    }

    fn identity_directory(&self) -> Arc<dyn IdentityDirectory<Error = BoxedError>> {
        self.identity_directory.clone()
    }

    fn payout_ledger(&self) -> Arc<dyn PayoutLedger<Error = BoxedError>> {
        self.payout_ledger.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_from_config() {
        let directory = StaticIdentityDirectory::new(&IdentityConfig {
            approve_all: false,
            approved_tutors: vec!["t-1".into()],
            suspended_tutors: vec!["t-2".into()],
            admins: vec!["ops".into()],
        });
        assert_eq!(directory.tutor_standing("t-1").await.unwrap(), TutorStanding::Approved);
        assert_eq!(directory.tutor_standing("t-2").await.unwrap(), TutorStanding::Suspended);
        assert_eq!(directory.tutor_standing("t-3").await.unwrap(), TutorStanding::NotApproved);
        assert!(directory.is_admin("ops").await.unwrap());
        assert!(!directory.is_admin("t-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_gateway_without_payrexx() {
        let factory = TutorbookServiceFactory::new(&AppConfig::default());
        let gateway = factory.payment_gateway();
        let session = gateway
            .create_checkout(CheckoutRequest {
                reference: "9".into(),
                amount: "40.00".parse().unwrap(),
                description: "1 lesson slot(s) with tutor-1".into(),
                return_url: None,
                cancel_url: None,
                expires_in_minutes: 10,
            })
            .await
            .unwrap();
        assert_eq!(session.link_id, "local-1");
        assert_eq!(
            gateway.checkout_status(&session.link_id).await.unwrap(),
            CheckoutOutcome::Pending
        );
    }
}
