// --- File: crates/tutorbook_booking/src/engine.rs ---
//! Wiring of the engine: the collaborators every coordinator shares and the settings derived
//! from the `booking` configuration section.

use chrono::Duration;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, warn};
use tutorbook_common::models::Slot;
use tutorbook_common::services::{
    BoxedError, IdentityDirectory, Notification, NotificationService, PaymentGateway,
    PayoutLedger, ServiceFactory, TutorStanding,
};
use tutorbook_config::BookingConfig;
use tutorbook_db::BookingStore;

use crate::auth::{AuthContext, Role};
use crate::clock::Clock;
use crate::error::BookingError;
use crate::plans::BookingPlanCatalog;
use crate::refund::RefundCoordinator;
use crate::reservation::ReservationCoordinator;
use crate::settlement::SettlementEngine;
use crate::sweeper::ExpirySweeper;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct BookingSettings {
    pub package_lock_ttl: Duration,
    /// Lifetime of a checkout link, also the hold length of a direct booking.
    pub checkout_expiry: Duration,
    pub sweep_interval: StdDuration,
    pub commission_rate: Decimal,
    pub max_weekly_days: usize,
    pub time_zone: Tz,
    pub webhook_secret: Option<String>,
}

impl BookingSettings {
    pub fn from_config(config: &BookingConfig) -> Result<Self, BookingError> {
        let time_zone = Tz::from_str(&config.time_zone).map_err(|_| {
            BookingError::invalid(format!("unknown time zone '{}'", config.time_zone))
        })?;
        if config.package_lock_ttl_minutes <= 0 {
            return Err(BookingError::invalid("package_lock_ttl_minutes must be positive"));
        }
        if config.commission_rate < Decimal::ZERO || config.commission_rate > Decimal::ONE {
            return Err(BookingError::invalid("commission_rate must be within 0..=1"));
        }

        Ok(Self {
            package_lock_ttl: Duration::minutes(config.package_lock_ttl_minutes),
            checkout_expiry: Duration::minutes(config.effective_checkout_expiry_minutes()),
            sweep_interval: StdDuration::from_secs(config.sweep_interval_secs.max(1)),
            commission_rate: config.commission_rate,
            max_weekly_days: config.max_weekly_days,
            time_zone,
            webhook_secret: config.webhook_secret.clone().filter(|s| !s.is_empty()),
        })
    }
}

impl Default for BookingSettings {
    fn default() -> Self {
        Self {
            package_lock_ttl: Duration::minutes(10),
            checkout_expiry: Duration::minutes(10),
            sweep_interval: StdDuration::from_secs(60),
            commission_rate: Decimal::new(10, 2),
            max_weekly_days: 4,
            time_zone: Tz::UTC,
            webhook_secret: None,
        }
    }
}

/// Everything a coordinator talks to.
#[derive(Clone)]
pub struct BookingDeps {
    pub store: Arc<dyn BookingStore>,
    pub clock: Arc<dyn Clock>,
    pub gateway: Arc<dyn PaymentGateway<Error = BoxedError>>,
    pub notifier: Arc<dyn NotificationService<Error = BoxedError>>,
    pub directory: Arc<dyn IdentityDirectory<Error = BoxedError>>,
    pub ledger: Arc<dyn PayoutLedger<Error = BoxedError>>,
    pub settings: Arc<BookingSettings>,
}

impl BookingDeps {
    pub fn from_factory(
        store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        services: &dyn ServiceFactory,
        settings: BookingSettings,
    ) -> Self {
        Self {
            store,
            clock,
            gateway: services.payment_gateway(),
            notifier: services.notification_service(),
            directory: services.identity_directory(),
            ledger: services.payout_ledger(),
            settings: Arc::new(settings),
        }
    }

    /// Sends a notification; failures are logged and swallowed.
    pub(crate) async fn notify(&self, notification: Notification) {
        let user_id = notification.user_id.clone();
        match self.notifier.notify(notification).await {
            Ok(()) => debug!("Notified {}", user_id),
            Err(e) => warn!("Failed to notify {}: {}", user_id, e),
        }
    }

    /// Invalidates checkout links; failures are logged and swallowed.
    pub(crate) async fn cancel_checkouts(&self, link_ids: &[String]) {
        for link_id in link_ids {
            if let Err(e) = self.gateway.cancel_checkout(link_id).await {
                warn!("Failed to cancel checkout {}: {}", link_id, e);
            }
        }
    }

    pub(crate) async fn ensure_admin(&self, auth: &AuthContext) -> Result<(), BookingError> {
        if auth.role == Role::Admin {
            return Ok(());
        }
        let listed = self
            .directory
            .is_admin(&auth.user_id)
            .await
            .map_err(|e| BookingError::Gateway(format!("identity directory: {}", e)))?;
        if listed {
            Ok(())
        } else {
            Err(BookingError::unauthorized("admin access required"))
        }
    }

    pub(crate) async fn ensure_tutor_in_good_standing(
        &self,
        tutor_id: &str,
    ) -> Result<(), BookingError> {
        let standing = self
            .directory
            .tutor_standing(tutor_id)
            .await
            .map_err(|e| BookingError::Gateway(format!("identity directory: {}", e)))?;
        match standing {
            TutorStanding::Approved => Ok(()),
            TutorStanding::NotApproved => Err(BookingError::TutorNotApproved(tutor_id.to_string())),
            TutorStanding::Suspended => Err(BookingError::TutorSuspended(tutor_id.to_string())),
        }
    }
}

/// Requires a non-empty, duplicate-free id list.
pub(crate) fn distinct_ids(ids: &[i64]) -> Result<Vec<i64>, BookingError> {
    if ids.is_empty() {
        return Err(BookingError::invalid("no slot ids given"));
    }
    let ordered = tutorbook_db::lock_order(ids);
    if ordered.len() != ids.len() {
        return Err(BookingError::invalid("slot ids must not repeat"));
    }
    Ok(ordered)
}

/// Maps requested ids onto the rows `lock_slots` returned; an id without a row is unavailable.
pub(crate) fn require_all(ids: &[i64], slots: &[Slot]) -> Result<(), BookingError> {
    match ids.iter().find(|id| !slots.iter().any(|slot| slot.id == **id)) {
        Some(missing) => Err(BookingError::SlotUnavailable(*missing)),
        None => Ok(()),
    }
}

/// Evidence of attendance or of a complaint must be a web link.
pub(crate) fn require_evidence_url(url: &str) -> Result<(), BookingError> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or_default();
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        Err(BookingError::invalid("evidence_url must be an http(s) link"))
    } else {
        Ok(())
    }
}

/// The engine: one instance of each coordinator over shared dependencies.
#[derive(Clone)]
pub struct BookingEngine {
    pub deps: BookingDeps,
    pub plans: BookingPlanCatalog,
    pub reservations: ReservationCoordinator,
    pub sweeper: ExpirySweeper,
    pub settlement: SettlementEngine,
    pub refunds: RefundCoordinator,
}

impl BookingEngine {
    pub fn new(deps: BookingDeps) -> Self {
        Self {
            plans: BookingPlanCatalog::new(deps.clone()),
            reservations: ReservationCoordinator::new(deps.clone()),
            sweeper: ExpirySweeper::new(deps.clone()),
            settlement: SettlementEngine::new(deps.clone()),
            refunds: RefundCoordinator::new(deps.clone()),
            deps,
        }
    }
}
