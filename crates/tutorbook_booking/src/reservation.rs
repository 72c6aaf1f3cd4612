// --- File: crates/tutorbook_booking/src/reservation.rs ---
//! Lock → confirm transitions for direct (pay per booking) and package (pre-paid quota) flows.
//!
//! Every operation locks its slot rows up front through [`BookingTx::lock_slots`], which takes
//! them in ascending id order, and evaluates its preconditions only afterwards. Contested
//! slots are never waited for at the rule level: whoever gets the row second sees the first
//! caller's committed state and fails with `SlotUnavailable`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};
use tutorbook_common::models::{
    PackageId, Payment, PaymentId, PaymentStatus, PaymentType, Slot, SlotId, SlotStatus,
};
use tutorbook_common::services::{CheckoutOutcome, CheckoutRequest, CheckoutSession, Notification};
use tutorbook_db::BookingTx;

use crate::auth::AuthContext;
use crate::engine::{distinct_ids, require_all, BookingDeps};
use crate::error::BookingError;
use crate::money::{commission, slot_price};

/// How a lock will be paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingContext {
    /// One checkout covering all locked slots.
    Direct,
    /// Consumes the remaining quota of a purchased package.
    Package { package_id: PackageId },
}

/// What a confirmation finalizes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfirmTarget {
    Payment { payment_id: PaymentId },
    Package { package_id: PackageId },
}

#[derive(Debug, Clone, Serialize)]
pub struct LockOutcome {
    pub slots: Vec<Slot>,
    pub expires_at: DateTime<Utc>,
    pub payment: Option<Payment>,
    pub checkout: Option<CheckoutSession>,
}

/// Result of applying a gateway outcome to a payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OutcomeApplied {
    Finalized { payment: Payment, slots: Vec<SlotId> },
    AlreadyPaid { payment_id: PaymentId },
    Released { payment_id: PaymentId, slots: Vec<SlotId> },
    Ignored { payment_id: PaymentId, status: PaymentStatus },
}

/// Reclaims a lapsed hold in place. Returns the payment the hold was tied to.
pub(crate) fn lazy_reclaim(slot: &mut Slot, now: DateTime<Utc>) -> Option<PaymentId> {
    if !slot.is_lapsed(now) {
        return None;
    }
    debug!("Lazily reclaiming slot {} (hold ended {:?})", slot.id, slot.expires_at);
    let payment_id = slot.payment_id;
    slot.reclaim();
    payment_id
}

fn held_elsewhere(slot_id: SlotId) -> BookingError {
    BookingError::unauthorized(format!("slot {} is held by someone else", slot_id))
}

/// Moves locked `payment_ids` that no longer back any Locked slot to `status`.
/// Returns the checkout links to invalidate once the transaction has committed.
pub(crate) async fn close_orphaned_payments(
    tx: &mut Box<dyn BookingTx>,
    payment_ids: &BTreeSet<PaymentId>,
    status: PaymentStatus,
) -> Result<Vec<String>, BookingError> {
    let mut links = Vec::new();
    for payment_id in payment_ids {
        let Some(mut payment) = tx.lock_payment(*payment_id).await? else {
            continue;
        };
        if payment.status != PaymentStatus::Pending {
            continue;
        }
        let still_held = tx
            .slots_for_payment(payment.id)
            .await?
            .iter()
            .any(|slot| slot.status == SlotStatus::Locked);
        if still_held {
            continue;
        }
        payment.status = status;
        tx.update_payment(&payment).await?;
        info!("Payment {} is now {}", payment.id, status);
        links.extend(payment.link_id);
    }
    Ok(links)
}

#[derive(Clone)]
pub struct ReservationCoordinator {
    deps: BookingDeps,
}

impl ReservationCoordinator {
    pub fn new(deps: BookingDeps) -> Self {
        Self { deps }
    }

    /// Places a time-bounded hold on every slot in `slot_ids`, or on none of them.
    ///
    /// A direct booking also creates one pending payment for the whole batch and then asks the
    /// gateway for a checkout link. The link is requested after the hold is committed; if the
    /// gateway fails the hold stays and simply expires.
    pub async fn lock_slots(
        &self,
        auth: &AuthContext,
        slot_ids: &[SlotId],
        context: BookingContext,
    ) -> Result<LockOutcome, BookingError> {
        let ids = distinct_ids(slot_ids)?;
        let now = self.deps.clock.now();
        let mut tx = self.deps.store.begin().await?;

        let package = match context {
            BookingContext::Package { package_id } => {
                let package = tx
                    .lock_package(package_id)
                    .await?
                    .ok_or_else(|| BookingError::not_found("package", package_id))?;
                if !auth.is(&package.learner_id) {
                    return Err(BookingError::unauthorized("package belongs to another learner"));
                }
                if !package.active {
                    return Err(BookingError::invalid(format!(
                        "package {} is not active",
                        package_id
                    )));
                }
                Some(package)
            }
            BookingContext::Direct => None,
        };

        let mut slots = tx.lock_slots(&ids).await?;
        require_all(&ids, &slots)?;

        let mut lapsed_payments = BTreeSet::new();
        for slot in slots.iter_mut() {
            lapsed_payments.extend(lazy_reclaim(slot, now));

            if slot.status != SlotStatus::Available || slot.learner_id.is_some() {
                debug!("Slot {} is {}", slot.id, slot.status);
                return Err(BookingError::SlotUnavailable(slot.id));
            }
            if slot.start_time <= now {
                debug!("Slot {} has already started", slot.id);
                return Err(BookingError::SlotUnavailable(slot.id));
            }
            if let Some(package) = &package {
                if slot.tutor_id != package.tutor_id {
                    debug!("Slot {} is not offered by the package tutor", slot.id);
                    return Err(BookingError::SlotUnavailable(slot.id));
                }
            }
        }

        let tutor_id = slots[0].tutor_id.clone();
        if slots.iter().any(|slot| slot.tutor_id != tutor_id) {
            return Err(BookingError::invalid("all slots of one booking must have the same tutor"));
        }
        if auth.is(&tutor_id) {
            return Err(BookingError::invalid("tutors cannot book their own slots"));
        }

        let ttl = match package {
            Some(_) => self.deps.settings.package_lock_ttl,
            None => self.deps.settings.checkout_expiry,
        };
        let expires_at = now + ttl;

        let payment = match package {
            Some(_) => None,
            None => {
                let mut amount = Decimal::ZERO;
                for slot in &slots {
                    let plan = tx
                        .plan(slot.plan_id)
                        .await?
                        .ok_or_else(|| BookingError::not_found("plan", slot.plan_id))?;
                    amount += slot_price(plan.hourly_price, slot.duration_minutes());
                }
                let payment = tx
                    .insert_payment(Payment {
                        id: 0,
                        tutor_id: tutor_id.clone(),
                        learner_id: auth.user_id.clone(),
                        amount,
                        payment_type: PaymentType::Booking,
                        status: PaymentStatus::Pending,
                        created_at: now,
                        expires_at,
                        paid_at: None,
                        link_id: None,
                        checkout_url: None,
                        qr_url: None,
                        commission_rate: None,
                        commission_amount: None,
                        net_amount: None,
                    })
                    .await?;
                Some(payment)
            }
        };

        for slot in slots.iter_mut() {
            slot.learner_id = Some(auth.user_id.clone());
            slot.status = SlotStatus::Locked;
            slot.locked_at = Some(now);
            slot.expires_at = Some(expires_at);
            slot.package_id = package.as_ref().map(|p| p.id);
            slot.payment_id = payment.as_ref().map(|p| p.id);
            tx.update_slot(slot).await?;
        }

        let stale_links =
            close_orphaned_payments(&mut tx, &lapsed_payments, PaymentStatus::Expired).await?;
        tx.commit().await?;
        info!(
            "Learner {} locked slots {:?} until {}",
            auth.user_id, ids, expires_at
        );
        self.deps.cancel_checkouts(&stale_links).await;

        let Some(payment) = payment else {
            return Ok(LockOutcome {
                slots,
                expires_at,
                payment: None,
                checkout: None,
            });
        };

        let (payment, checkout) = self.open_checkout(payment, &slots).await?;
        Ok(LockOutcome {
            slots,
            expires_at,
            payment: Some(payment),
            checkout: Some(checkout),
        })
    }

    async fn open_checkout(
        &self,
        payment: Payment,
        slots: &[Slot],
    ) -> Result<(Payment, CheckoutSession), BookingError> {
        let minutes = (payment.expires_at - payment.created_at).num_minutes();
        let request = CheckoutRequest {
            reference: payment.id.to_string(),
            amount: payment.amount,
            description: format!("{} lesson slot(s) with {}", slots.len(), payment.tutor_id),
            return_url: None,
            cancel_url: None,
            expires_in_minutes: minutes,
        };
        let session = self.deps.gateway.create_checkout(request).await.map_err(|e| {
            error!("Checkout creation for payment {} failed: {}", payment.id, e);
            BookingError::Gateway(e.to_string())
        })?;

        let mut tx = self.deps.store.begin().await?;
        let mut stored = tx
            .lock_payment(payment.id)
            .await?
            .ok_or_else(|| BookingError::not_found("payment", payment.id))?;
        stored.link_id = Some(session.link_id.clone());
        stored.checkout_url = Some(session.checkout_url.clone());
        stored.qr_url = session.qr_url.clone();
        tx.update_payment(&stored).await?;
        tx.commit().await?;
        info!("Payment {} has checkout link {}", stored.id, session.link_id);
        Ok((stored, session))
    }

    /// Finalizes previously locked slots.
    pub async fn confirm_slots(
        &self,
        auth: &AuthContext,
        slot_ids: &[SlotId],
        target: ConfirmTarget,
    ) -> Result<Vec<Slot>, BookingError> {
        match target {
            ConfirmTarget::Package { package_id } => {
                self.confirm_with_package(auth, slot_ids, package_id).await
            }
            ConfirmTarget::Payment { payment_id } => {
                self.confirm_with_payment(auth, slot_ids, payment_id).await
            }
        }
    }

    async fn confirm_with_package(
        &self,
        auth: &AuthContext,
        slot_ids: &[SlotId],
        package_id: PackageId,
    ) -> Result<Vec<Slot>, BookingError> {
        let ids = distinct_ids(slot_ids)?;
        let now = self.deps.clock.now();
        let mut tx = self.deps.store.begin().await?;

        let mut package = tx
            .lock_package(package_id)
            .await?
            .ok_or_else(|| BookingError::not_found("package", package_id))?;
        if !auth.is(&package.learner_id) {
            return Err(BookingError::unauthorized("package belongs to another learner"));
        }

        let mut slots = tx.lock_slots(&ids).await?;
        require_all(&ids, &slots)?;

        for slot in &slots {
            let held_by_caller = slot.learner_id.as_deref() == Some(auth.user_id.as_str());
            if slot.status == SlotStatus::Locked && !held_by_caller {
                return Err(held_elsewhere(slot.id));
            }
            if slot.status != SlotStatus::Locked || slot.package_id != Some(package.id) {
                return Err(BookingError::SlotUnavailable(slot.id));
            }
            if slot.expires_at.map_or(true, |exp| exp <= now) {
                return Err(BookingError::SlotExpired(slot.id));
            }
        }

        let requested = slots.len();
        let covered = usize::try_from(package.remaining).map_or(false, |left| left >= requested);
        if !package.active || !covered {
            debug!(
                "Package {} has {} left, {} requested",
                package.id, package.remaining, requested
            );
            return Err(BookingError::QuotaExceeded {
                requested,
                remaining: package.remaining,
            });
        }

        for slot in slots.iter_mut() {
            slot.status = SlotStatus::Paid;
            slot.locked_at = None;
            slot.expires_at = None;
            tx.update_slot(slot).await?;
        }
        // requested <= remaining, so this stays within i32 and non-negative
        package.remaining -= requested as i32;
        tx.update_package(&package).await?;
        tx.commit().await?;

        info!(
            "Package {} paid for slots {:?}; {} left",
            package.id, ids, package.remaining
        );
        Ok(slots)
    }

    async fn confirm_with_payment(
        &self,
        auth: &AuthContext,
        slot_ids: &[SlotId],
        payment_id: PaymentId,
    ) -> Result<Vec<Slot>, BookingError> {
        let ids = distinct_ids(slot_ids)?;
        let payment = self
            .deps
            .store
            .payment(payment_id)
            .await?
            .ok_or_else(|| BookingError::not_found("payment", payment_id))?;
        if !auth.is(&payment.learner_id) {
            return Err(BookingError::unauthorized("payment belongs to another learner"));
        }

        if payment.status == PaymentStatus::Pending {
            let link_id = payment
                .link_id
                .clone()
                .ok_or_else(|| BookingError::invalid("payment has no checkout link"))?;
            let outcome = self
                .deps
                .gateway
                .checkout_status(&link_id)
                .await
                .map_err(|e| BookingError::Gateway(e.to_string()))?;
            match outcome {
                CheckoutOutcome::Pending => {
                    return Err(BookingError::invalid("checkout is not completed yet"));
                }
                CheckoutOutcome::Paid => {
                    self.finalize_payment(payment_id).await?;
                }
                CheckoutOutcome::Cancelled | CheckoutOutcome::Expired => {
                    self.release_payment(payment_id, outcome).await?;
                    return Err(BookingError::SlotExpired(ids[0]));
                }
            }
        }

        let mut confirmed = Vec::with_capacity(ids.len());
        for id in &ids {
            let slot = self
                .deps
                .store
                .slot(*id)
                .await?
                .ok_or(BookingError::SlotUnavailable(*id))?;
            if slot.payment_id != Some(payment_id) {
                return Err(BookingError::SlotUnavailable(*id));
            }
            match slot.status {
                SlotStatus::Paid | SlotStatus::Rejected => confirmed.push(slot),
                _ => return Err(BookingError::SlotExpired(*id)),
            }
        }
        Ok(confirmed)
    }

    /// Applies a terminal checkout outcome reported by the gateway.
    pub async fn process_payment_outcome(
        &self,
        link_id: &str,
        outcome: CheckoutOutcome,
    ) -> Result<OutcomeApplied, BookingError> {
        let payment = self
            .deps
            .store
            .payment_by_link(link_id)
            .await?
            .ok_or_else(|| BookingError::not_found("checkout", link_id))?;
        match outcome {
            CheckoutOutcome::Paid => self.finalize_payment(payment.id).await,
            CheckoutOutcome::Cancelled | CheckoutOutcome::Expired => {
                self.release_payment(payment.id, outcome).await
            }
            CheckoutOutcome::Pending => Ok(OutcomeApplied::Ignored {
                payment_id: payment.id,
                status: payment.status,
            }),
        }
    }

    /// Marks a payment paid, captures its commission snapshot and moves its held slots to Paid.
    async fn finalize_payment(
        &self,
        payment_id: PaymentId,
    ) -> Result<OutcomeApplied, BookingError> {
        let now = self.deps.clock.now();
        let mut tx = self.deps.store.begin().await?;

        let candidates: Vec<SlotId> = tx
            .slots_for_payment(payment_id)
            .await?
            .iter()
            .map(|slot| slot.id)
            .collect();
        let mut slots: Vec<Slot> = tx
            .lock_slots(&candidates)
            .await?
            .into_iter()
            .filter(|slot| slot.payment_id == Some(payment_id))
            .collect();
        let mut payment = tx
            .lock_payment(payment_id)
            .await?
            .ok_or_else(|| BookingError::not_found("payment", payment_id))?;

        match payment.status {
            PaymentStatus::Paid => {
                debug!("Payment {} was already finalized", payment_id);
                return Ok(OutcomeApplied::AlreadyPaid { payment_id });
            }
            PaymentStatus::Expired | PaymentStatus::Cancelled => {
                error!(
                    "Payment {} reported paid after it was {}; its slots were released",
                    payment_id, payment.status
                );
                return Ok(OutcomeApplied::Ignored {
                    payment_id,
                    status: payment.status,
                });
            }
            PaymentStatus::Pending => {}
        }

        let intact = !slots.is_empty()
            && payment.expires_at > now
            && slots.iter().all(|slot| {
                slot.status == SlotStatus::Locked
                    && slot.learner_id.as_deref() == Some(payment.learner_id.as_str())
                    && slot.expires_at.map_or(false, |exp| exp > now)
            });
        if !intact {
            return self.expire_late_payment(tx, payment, slots, &candidates).await;
        }

        if payment.net_amount.is_none() {
            let split = commission(payment.amount, self.deps.settings.commission_rate);
            payment.commission_rate = Some(split.rate);
            payment.commission_amount = Some(split.amount);
            payment.net_amount = Some(split.net);
        }
        payment.status = PaymentStatus::Paid;
        payment.paid_at = Some(now);

        let mut finalized = Vec::new();
        for slot in slots.iter_mut().filter(|slot| slot.status == SlotStatus::Locked) {
            slot.status = SlotStatus::Paid;
            slot.locked_at = None;
            slot.expires_at = None;
            tx.update_slot(slot).await?;
            finalized.push(slot.id);
        }
        tx.update_payment(&payment).await?;
        tx.commit().await?;

        info!(
            "Payment {} paid: slots {:?}, net {:?}",
            payment.id, finalized, payment.net_amount
        );
        self.deps
            .notify(Notification::new(
                &payment.learner_id,
                "Booking confirmed",
                format!("Your booking of {} slot(s) is confirmed.", finalized.len()),
            ))
            .await;
        self.deps
            .notify(Notification::new(
                &payment.tutor_id,
                "New booking",
                format!("{} slot(s) were booked by {}.", finalized.len(), payment.learner_id),
            ))
            .await;

        Ok(OutcomeApplied::Finalized {
            payment,
            slots: finalized,
        })
    }

    /// Closes a payment reported paid after its hold lapsed or was partly taken over. Its
    /// remaining holds are released; the captured money is left for manual reconciliation.
    async fn expire_late_payment(
        &self,
        mut tx: Box<dyn BookingTx>,
        mut payment: Payment,
        mut slots: Vec<Slot>,
        candidates: &[SlotId],
    ) -> Result<OutcomeApplied, BookingError> {
        let mut released = Vec::new();
        for slot in slots.iter_mut().filter(|slot| slot.status == SlotStatus::Locked) {
            slot.reclaim();
            tx.update_slot(slot).await?;
            released.push(slot.id);
        }
        payment.status = PaymentStatus::Expired;
        tx.update_payment(&payment).await?;
        tx.commit().await?;

        error!(
            "Payment {} of {} reported paid after its hold expired at {}; released {:?}, \
             reconcile manually",
            payment.id, payment.amount, payment.expires_at, released
        );
        self.deps
            .notify(Notification::new(
                &payment.learner_id,
                "Booking not completed",
                "Your payment arrived after the reservation expired. Support will reconcile it.",
            ))
            .await;

        match candidates.first() {
            Some(slot_id) => Err(BookingError::SlotExpired(*slot_id)),
            None => Ok(OutcomeApplied::Ignored {
                payment_id: payment.id,
                status: payment.status,
            }),
        }
    }

    /// Gives the held slots of an unpaid payment back and closes the payment.
    async fn release_payment(
        &self,
        payment_id: PaymentId,
        outcome: CheckoutOutcome,
    ) -> Result<OutcomeApplied, BookingError> {
        let mut tx = self.deps.store.begin().await?;

        let candidates: Vec<SlotId> = tx
            .slots_for_payment(payment_id)
            .await?
            .iter()
            .map(|slot| slot.id)
            .collect();
        let mut slots = tx.lock_slots(&candidates).await?;
        let mut payment = tx
            .lock_payment(payment_id)
            .await?
            .ok_or_else(|| BookingError::not_found("payment", payment_id))?;

        if payment.status != PaymentStatus::Pending {
            debug!("Payment {} is already {}", payment_id, payment.status);
            return Ok(OutcomeApplied::Ignored {
                payment_id,
                status: payment.status,
            });
        }

        let mut released = Vec::new();
        for slot in slots
            .iter_mut()
            .filter(|slot| slot.payment_id == Some(payment_id) && slot.status == SlotStatus::Locked)
        {
            slot.reclaim();
            tx.update_slot(slot).await?;
            released.push(slot.id);
        }
        payment.status = match outcome {
            CheckoutOutcome::Expired => PaymentStatus::Expired,
            _ => PaymentStatus::Cancelled,
        };
        tx.update_payment(&payment).await?;
        tx.commit().await?;

        info!(
            "Payment {} {}; released slots {:?}",
            payment_id, payment.status, released
        );
        self.deps
            .notify(Notification::new(
                &payment.learner_id,
                "Booking not completed",
                "Your checkout was not completed and the held slots were released.",
            ))
            .await;
        Ok(OutcomeApplied::Released {
            payment_id,
            slots: released,
        })
    }

    /// Cancels the caller's own holds.
    pub async fn release_slots(
        &self,
        auth: &AuthContext,
        slot_ids: &[SlotId],
    ) -> Result<Vec<Slot>, BookingError> {
        let ids = distinct_ids(slot_ids)?;
        let mut tx = self.deps.store.begin().await?;
        let mut slots = tx.lock_slots(&ids).await?;
        require_all(&ids, &slots)?;

        for slot in &slots {
            if slot.status != SlotStatus::Locked {
                return Err(BookingError::SlotUnavailable(slot.id));
            }
            if slot.learner_id.as_deref() != Some(auth.user_id.as_str()) {
                return Err(held_elsewhere(slot.id));
            }
        }

        let mut payments = BTreeSet::new();
        for slot in slots.iter_mut() {
            payments.extend(slot.payment_id);
            slot.reclaim();
            tx.update_slot(slot).await?;
        }
        let links = close_orphaned_payments(&mut tx, &payments, PaymentStatus::Cancelled).await?;
        tx.commit().await?;

        info!("Learner {} released slots {:?}", auth.user_id, ids);
        self.deps.cancel_checkouts(&links).await;
        Ok(slots)
    }

    pub async fn slot(&self, slot_id: SlotId) -> Result<Slot, BookingError> {
        self.deps
            .store
            .slot(slot_id)
            .await?
            .ok_or_else(|| BookingError::not_found("slot", slot_id))
    }

    pub async fn payment(
        &self,
        auth: &AuthContext,
        payment_id: PaymentId,
    ) -> Result<Payment, BookingError> {
        let payment = self
            .deps
            .store
            .payment(payment_id)
            .await?
            .ok_or_else(|| BookingError::not_found("payment", payment_id))?;
        if !auth.is(&payment.learner_id) && !auth.is(&payment.tutor_id) {
            warn!("{} asked for payment {} of someone else", auth.user_id, payment_id);
            return Err(BookingError::unauthorized("payment belongs to someone else"));
        }
        Ok(payment)
    }
}
