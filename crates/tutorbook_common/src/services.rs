// --- File: crates/tutorbook_common/src/services.rs ---
//! Service abstractions for the collaborators the booking engine talks to.
//!
//! The engine only depends on these traits; the backend decides which implementation is
//! wired in, and tests use the recording doubles in [`mock`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::models::{BankDetails, RefundId};

/// Type alias for a boxed future that returns a Result
pub type BoxFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// A `std::error::Error` wrapper around `Box<dyn std::error::Error + Send + Sync>`.
#[derive(Debug)]
pub struct BoxedError(pub Box<dyn StdError + Send + Sync>);

impl BoxedError {
    pub fn new<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        BoxedError(Box::new(err))
    }

    pub fn msg<M: fmt::Display>(message: M) -> Self {
        BoxedError(message.to_string().into())
    }
}

impl fmt::Display for BoxedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StdError for BoxedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl From<Box<dyn StdError + Send + Sync>> for BoxedError {
    fn from(err: Box<dyn StdError + Send + Sync>) -> Self {
        BoxedError(err)
    }
}

// --- Payment gateway ---

/// What the engine asks the gateway for when a direct booking needs paying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Local payment id, echoed back by the gateway as its reference.
    pub reference: String,
    pub amount: Decimal,
    pub description: String,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
    pub expires_in_minutes: i64,
}

/// A checkout link created at the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub link_id: String,
    pub checkout_url: String,
    pub qr_url: Option<String>,
}

/// State of a checkout as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutOutcome {
    Pending,
    Paid,
    Cancelled,
    Expired,
}

impl CheckoutOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckoutOutcome::Pending)
    }
}

pub trait PaymentGateway: Send + Sync {
    /// Error type returned by gateway operations.
    type Error: StdError + Send + Sync + 'static;

    fn create_checkout(
        &self,
        request: CheckoutRequest,
    ) -> BoxFuture<'_, CheckoutSession, Self::Error>;

    /// Invalidates a checkout link. Cancelling an unknown or already closed link is not an error.
    fn cancel_checkout(&self, link_id: &str) -> BoxFuture<'_, (), Self::Error>;

    fn checkout_status(&self, link_id: &str) -> BoxFuture<'_, CheckoutOutcome, Self::Error>;
}

// --- Notifications ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(user_id: &str, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Fire-and-forget delivery of user notifications.
pub trait NotificationService: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    fn notify(&self, notification: Notification) -> BoxFuture<'_, (), Self::Error>;
}

// --- Identity directory ---

/// Where a tutor stands with the platform's vetting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TutorStanding {
    Approved,
    NotApproved,
    Suspended,
}

/// Read-only lookups about already-identified users.
pub trait IdentityDirectory: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    fn tutor_standing(&self, tutor_id: &str) -> BoxFuture<'_, TutorStanding, Self::Error>;

    fn is_admin(&self, user_id: &str) -> BoxFuture<'_, bool, Self::Error>;
}

// --- Payout ledger ---

/// An approved refund handed to the payout subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundPayout {
    pub refund_id: RefundId,
    pub learner_id: String,
    pub amount: Decimal,
    pub bank: BankDetails,
}

pub trait PayoutLedger: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    fn record_refund_payout(&self, payout: RefundPayout) -> BoxFuture<'_, (), Self::Error>;
}

/// A factory for the collaborator implementations the engine runs against.
pub trait ServiceFactory: Send + Sync {
    fn payment_gateway(&self) -> Arc<dyn PaymentGateway<Error = BoxedError>>;

    fn notification_service(&self) -> Arc<dyn NotificationService<Error = BoxedError>>;

    fn identity_directory(&self) -> Arc<dyn IdentityDirectory<Error = BoxedError>>;

    fn payout_ledger(&self) -> Arc<dyn PayoutLedger<Error = BoxedError>>;
}

/// Recording doubles for tests of code that sits on top of these traits.
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Mutex, MutexGuard};

    fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Gateway double: issues sequential link ids and remembers what it was asked.
    #[derive(Default)]
    pub struct MockPaymentGateway {
        next_link: AtomicU64,
        fail_create: AtomicBool,
        created: Mutex<Vec<CheckoutRequest>>,
        cancelled: Mutex<Vec<String>>,
        outcomes: Mutex<HashMap<String, CheckoutOutcome>>,
    }

    impl MockPaymentGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail_create(&self, fail: bool) {
            self.fail_create.store(fail, Ordering::SeqCst);
        }

        /// Sets what `checkout_status` reports for `link_id`.
        pub fn set_outcome(&self, link_id: &str, outcome: CheckoutOutcome) {
            guard(&self.outcomes).insert(link_id.to_string(), outcome);
        }

        pub fn created(&self) -> Vec<CheckoutRequest> {
            guard(&self.created).clone()
        }

        pub fn cancelled(&self) -> Vec<String> {
            guard(&self.cancelled).clone()
        }
    }

    impl PaymentGateway for MockPaymentGateway {
        type Error = BoxedError;

        fn create_checkout(
            &self,
            request: CheckoutRequest,
        ) -> BoxFuture<'_, CheckoutSession, Self::Error> {
            Box::pin(async move {
                if self.fail_create.load(Ordering::SeqCst) {
                    return Err(BoxedError::msg("gateway unavailable"));
                }
                let n = self.next_link.fetch_add(1, Ordering::SeqCst) + 1;
                let link_id = format!("link-{}", n);
                guard(&self.created).push(request);
                guard(&self.outcomes).insert(link_id.clone(), CheckoutOutcome::Pending);
                Ok(CheckoutSession {
                    checkout_url: format!("https://pay.example.test/{}", link_id),
                    qr_url: None,
                    link_id,
                })
            })
        }

        fn cancel_checkout(&self, link_id: &str) -> BoxFuture<'_, (), Self::Error> {
            let link_id = link_id.to_string();
            Box::pin(async move {
                guard(&self.cancelled).push(link_id.clone());
                guard(&self.outcomes).insert(link_id, CheckoutOutcome::Cancelled);
                Ok(())
            })
        }

        fn checkout_status(&self, link_id: &str) -> BoxFuture<'_, CheckoutOutcome, Self::Error> {
            let link_id = link_id.to_string();
            Box::pin(async move {
                guard(&self.outcomes)
                    .get(&link_id)
                    .copied()
                    .ok_or_else(|| BoxedError::msg(format!("unknown checkout {}", link_id)))
            })
        }
    }

    /// Keeps every notification it is handed.
    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<Notification> {
            guard(&self.sent).clone()
        }

        pub fn sent_to(&self, user_id: &str) -> Vec<Notification> {
            guard(&self.sent)
                .iter()
                .filter(|n| n.user_id == user_id)
                .cloned()
                .collect()
        }
    }

    impl NotificationService for RecordingNotifier {
        type Error = BoxedError;

        fn notify(&self, notification: Notification) -> BoxFuture<'_, (), Self::Error> {
            Box::pin(async move {
                guard(&self.sent).push(notification);
                Ok(())
            })
        }
    }

    /// Directory double; tutors are approved unless listed otherwise.
    #[derive(Default)]
    pub struct MockIdentityDirectory {
        not_approved: Mutex<HashSet<String>>,
        suspended: Mutex<HashSet<String>>,
        admins: Mutex<HashSet<String>>,
    }

    impl MockIdentityDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_standing(&self, tutor_id: &str, standing: TutorStanding) {
            guard(&self.not_approved).remove(tutor_id);
            guard(&self.suspended).remove(tutor_id);
            match standing {
                TutorStanding::Approved => {}
                TutorStanding::NotApproved => {
                    guard(&self.not_approved).insert(tutor_id.to_string());
                }
                TutorStanding::Suspended => {
                    guard(&self.suspended).insert(tutor_id.to_string());
                }
            }
        }

        pub fn add_admin(&self, user_id: &str) {
            guard(&self.admins).insert(user_id.to_string());
        }
    }

    impl IdentityDirectory for MockIdentityDirectory {
        type Error = BoxedError;

        fn tutor_standing(&self, tutor_id: &str) -> BoxFuture<'_, TutorStanding, Self::Error> {
            let tutor_id = tutor_id.to_string();
            Box::pin(async move {
                if guard(&self.suspended).contains(&tutor_id) {
                    Ok(TutorStanding::Suspended)
                } else if guard(&self.not_approved).contains(&tutor_id) {
                    Ok(TutorStanding::NotApproved)
                } else {
                    Ok(TutorStanding::Approved)
                }
            })
        }

        fn is_admin(&self, user_id: &str) -> BoxFuture<'_, bool, Self::Error> {
            let user_id = user_id.to_string();
            Box::pin(async move { Ok(guard(&self.admins).contains(&user_id)) })
        }
    }

    #[derive(Default)]
    pub struct RecordingPayoutLedger {
        payouts: Mutex<Vec<RefundPayout>>,
    }

    impl RecordingPayoutLedger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn payouts(&self) -> Vec<RefundPayout> {
            guard(&self.payouts).clone()
        }
    }

    impl PayoutLedger for RecordingPayoutLedger {
        type Error = BoxedError;

        fn record_refund_payout(&self, payout: RefundPayout) -> BoxFuture<'_, (), Self::Error> {
            Box::pin(async move {
                guard(&self.payouts).push(payout);
                Ok(())
            })
        }
    }
}
