// --- File: crates/tutorbook_booking/src/refund.rs ---
//! Refund requests: learner complaints, plan-change invalidation and the admin decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use tutorbook_common::models::{
    BankDetails, RefundId, RefundReason, RefundRequest, RefundStatus, Slot, SlotId, SlotStatus,
};
use tutorbook_common::services::{Notification, RefundPayout};
use tutorbook_db::BookingTx;

use crate::auth::AuthContext;
use crate::engine::{require_evidence_url, BookingDeps};
use crate::error::BookingError;
use crate::money::refund_amount;

/// A learner's dispute of a paid slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Complaint {
    pub evidence_url: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub bank: BankDetails,
}

/// Builds a pending refund for `slot` priced at the plan's hourly rate.
async fn pending_refund(
    tx: &mut Box<dyn BookingTx>,
    slot: &Slot,
    reason: RefundReason,
    note: Option<String>,
    evidence_url: Option<String>,
    bank: BankDetails,
    now: DateTime<Utc>,
) -> Result<RefundRequest, BookingError> {
    let learner_id = slot
        .learner_id
        .clone()
        .ok_or(BookingError::SlotUnavailable(slot.id))?;
    let plan = tx
        .plan(slot.plan_id)
        .await?
        .ok_or_else(|| BookingError::not_found("plan", slot.plan_id))?;

    let refund = tx
        .insert_refund(RefundRequest {
            id: 0,
            slot_id: slot.id,
            plan_id: slot.plan_id,
            learner_id,
            tutor_id: slot.tutor_id.clone(),
            package_id: slot.package_id,
            payment_id: slot.payment_id,
            amount: refund_amount(plan.hourly_price, slot.duration_minutes()),
            reason,
            note,
            evidence_url,
            bank,
            status: RefundStatus::Pending,
            admin_note: None,
            created_at: now,
            decided_at: None,
        })
        .await?;
    info!(
        "Refund {} of {} opened for slot {} ({})",
        refund.id, refund.amount, slot.id, reason
    );
    Ok(refund)
}

/// Voids a paid slot whose time window was removed by its tutor and opens a refund for it.
///
/// `slot` must be locked by `tx`. If a refund is already pending for the slot it is kept and
/// no second one is created.
pub(crate) async fn invalidate_in_tx(
    tx: &mut Box<dyn BookingTx>,
    slot: &mut Slot,
    note: Option<String>,
    now: DateTime<Utc>,
) -> Result<Option<RefundRequest>, BookingError> {
    if slot.status != SlotStatus::Paid {
        return Err(BookingError::SlotUnavailable(slot.id));
    }
    slot.status = SlotStatus::Rejected;
    tx.update_slot(slot).await?;
    info!("Slot {} rejected after a plan change", slot.id);

    if let Some(existing) = tx.pending_refund_for_slot(slot.id).await? {
        debug!("Slot {} already has pending refund {}", slot.id, existing.id);
        return Ok(None);
    }
    let refund = pending_refund(
        tx,
        slot,
        RefundReason::PlanChanged,
        note,
        None,
        BankDetails::default(),
        now,
    )
    .await?;
    Ok(Some(refund))
}

/// Tells both parties about a refund opened because the tutor changed availability.
pub(crate) async fn announce_invalidation(deps: &BookingDeps, refund: &RefundRequest) {
    deps.notify(Notification::new(
        &refund.learner_id,
        "Lesson cancelled by tutor",
        format!(
            "Your lesson (slot {}) was cancelled because the tutor changed availability. \
             A refund of {} is pending review.",
            refund.slot_id, refund.amount
        ),
    ))
    .await;
    deps.notify(Notification::new(
        &refund.tutor_id,
        "Booked lesson cancelled",
        format!(
            "Slot {} was booked and is cancelled by your plan change; \
             the learner will be refunded.",
            refund.slot_id
        ),
    ))
    .await;
}

#[derive(Clone)]
pub struct RefundCoordinator {
    deps: BookingDeps,
}

impl RefundCoordinator {
    pub fn new(deps: BookingDeps) -> Self {
        Self { deps }
    }

    /// Opens a refund request for a paid slot. The slot itself stays Paid.
    pub async fn learner_complain(
        &self,
        auth: &AuthContext,
        slot_id: SlotId,
        complaint: Complaint,
    ) -> Result<RefundRequest, BookingError> {
        require_evidence_url(&complaint.evidence_url)?;
        let now = self.deps.clock.now();
        let mut tx = self.deps.store.begin().await?;

        let slot = tx
            .lock_slots(&[slot_id])
            .await?
            .pop()
            .ok_or_else(|| BookingError::not_found("slot", slot_id))?;
        if slot.learner_id.as_deref() != Some(auth.user_id.as_str()) {
            return Err(BookingError::unauthorized("only the booking learner can complain"));
        }
        if slot.status != SlotStatus::Paid {
            return Err(BookingError::SlotUnavailable(slot_id));
        }
        if tx.pending_refund_for_slot(slot_id).await?.is_some() {
            return Err(BookingError::DuplicateRefund(slot_id));
        }

        let refund = pending_refund(
            &mut tx,
            &slot,
            RefundReason::LearnerComplaint,
            complaint.reason,
            Some(complaint.evidence_url.trim().to_string()),
            complaint.bank,
            now,
        )
        .await?;
        tx.commit().await?;

        self.deps
            .notify(Notification::new(
                &refund.tutor_id,
                "Lesson disputed",
                format!("The learner disputed slot {}; an admin will review it.", slot_id),
            ))
            .await;
        Ok(refund)
    }

    /// Voids one paid slot of the calling tutor and opens a refund for its learner.
    pub async fn invalidate_slot(
        &self,
        auth: &AuthContext,
        slot_id: SlotId,
        note: Option<String>,
    ) -> Result<Option<RefundRequest>, BookingError> {
        let now = self.deps.clock.now();
        let mut tx = self.deps.store.begin().await?;
        let mut slot = tx
            .lock_slots(&[slot_id])
            .await?
            .pop()
            .ok_or_else(|| BookingError::not_found("slot", slot_id))?;
        if !auth.is(&slot.tutor_id) {
            return Err(BookingError::unauthorized("only the slot's tutor can cancel it"));
        }
        let refund = invalidate_in_tx(&mut tx, &mut slot, note, now).await?;
        tx.commit().await?;

        if let Some(refund) = &refund {
            announce_invalidation(&self.deps, refund).await;
        }
        Ok(refund)
    }

    /// Approves a pending refund. A slot that is still Paid is voided; the payout is handed to
    /// the ledger once the decision is committed.
    pub async fn approve(
        &self,
        auth: &AuthContext,
        refund_id: RefundId,
        admin_note: Option<String>,
    ) -> Result<RefundRequest, BookingError> {
        self.deps.ensure_admin(auth).await?;
        let now = self.deps.clock.now();
        let seen = self
            .deps
            .store
            .refund(refund_id)
            .await?
            .ok_or_else(|| BookingError::not_found("refund", refund_id))?;

        let mut tx = self.deps.store.begin().await?;
        let mut slots = tx.lock_slots(&[seen.slot_id]).await?;
        let mut refund = tx
            .lock_refund(refund_id)
            .await?
            .ok_or_else(|| BookingError::not_found("refund", refund_id))?;
        if refund.status != RefundStatus::Pending {
            return Err(BookingError::invalid(format!(
                "refund {} is already {}",
                refund_id, refund.status
            )));
        }

        refund.status = RefundStatus::Approved;
        refund.admin_note = admin_note;
        refund.decided_at = Some(now);
        tx.update_refund(&refund).await?;

        if let Some(slot) = slots.first_mut() {
            if slot.status == SlotStatus::Paid {
                slot.status = SlotStatus::Rejected;
                tx.update_slot(slot).await?;
                info!("Slot {} rejected by refund {}", slot.id, refund_id);
            }
        }
        tx.commit().await?;
        info!("Refund {} approved by {}", refund_id, auth.user_id);

        let payout = RefundPayout {
            refund_id,
            learner_id: refund.learner_id.clone(),
            amount: refund.amount,
            bank: refund.bank.clone(),
        };
        if let Err(e) = self.deps.ledger.record_refund_payout(payout).await {
            error!("Payout of approved refund {} was not recorded: {}", refund_id, e);
        }
        self.deps
            .notify(Notification::new(
                &refund.learner_id,
                "Refund approved",
                format!("Your refund of {} was approved.", refund.amount),
            ))
            .await;
        Ok(refund)
    }

    pub async fn reject(
        &self,
        auth: &AuthContext,
        refund_id: RefundId,
        admin_note: Option<String>,
    ) -> Result<RefundRequest, BookingError> {
        self.deps.ensure_admin(auth).await?;
        let now = self.deps.clock.now();
        let mut tx = self.deps.store.begin().await?;
        let mut refund = tx
            .lock_refund(refund_id)
            .await?
            .ok_or_else(|| BookingError::not_found("refund", refund_id))?;
        if refund.status != RefundStatus::Pending {
            return Err(BookingError::invalid(format!(
                "refund {} is already {}",
                refund_id, refund.status
            )));
        }
        refund.status = RefundStatus::Rejected;
        refund.admin_note = admin_note;
        refund.decided_at = Some(now);
        tx.update_refund(&refund).await?;
        tx.commit().await?;
        info!("Refund {} rejected by {}", refund_id, auth.user_id);

        self.deps
            .notify(Notification::new(
                &refund.learner_id,
                "Refund rejected",
                format!("Your refund request for slot {} was rejected.", refund.slot_id),
            ))
            .await;
        Ok(refund)
    }

    pub async fn list_refunds(
        &self,
        auth: &AuthContext,
        status: Option<RefundStatus>,
    ) -> Result<Vec<RefundRequest>, BookingError> {
        self.deps.ensure_admin(auth).await?;
        Ok(self.deps.store.refunds(status).await?)
    }
}
