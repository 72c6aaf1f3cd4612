// --- File: crates/tutorbook_booking/src/settlement.rs ---
//! Attendance confirmation and wallet settlement.
//!
//! A tutor's balance is recomputed from scratch whenever a booking becomes fully attended:
//! the net of every paid booking whose paid slots are all mutually confirmed, minus approved
//! withdrawals. Recomputing keeps the balance correct even after an earlier partial failure.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tutorbook_common::models::{Slot, SlotId, SlotStatus, Wallet};
use tutorbook_db::BookingTx;

use crate::auth::AuthContext;
use crate::engine::{require_evidence_url, BookingDeps};
use crate::error::BookingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceParty {
    Tutor,
    Learner,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceOutcome {
    pub slot: Slot,
    /// Whether this confirmation completed its booking and triggered a wallet recompute.
    pub settled: bool,
    pub wallet: Option<Wallet>,
}

/// Balance of `tutor_id` derived from committed and staged state of `tx`.
///
/// Locks the wallet row; callers must not hold locks that come after it in the lock order.
pub(crate) async fn recompute_in_tx(
    tx: &mut Box<dyn BookingTx>,
    tutor_id: &str,
    now: DateTime<Utc>,
) -> Result<Wallet, BookingError> {
    let mut wallet = tx.lock_wallet(tutor_id).await?;

    let mut earned = Decimal::ZERO;
    for payment in tx.paid_booking_payments(tutor_id).await? {
        let paid: Vec<Slot> = tx
            .slots_for_payment(payment.id)
            .await?
            .into_iter()
            .filter(|slot| slot.status == SlotStatus::Paid)
            .collect();
        if paid.is_empty() || !paid.iter().all(Slot::is_mutually_confirmed) {
            continue;
        }
        match payment.net_amount {
            Some(net) => earned += net,
            None => warn!("Paid payment {} has no commission snapshot", payment.id),
        }
    }
    let withdrawn = tx.approved_withdrawal_total(tutor_id).await?;

    wallet.balance = earned - withdrawn;
    wallet.updated_at = Some(now);
    tx.save_wallet(&wallet).await?;
    debug!(
        "Wallet of {}: earned {} withdrawn {} balance {}",
        tutor_id, earned, withdrawn, wallet.balance
    );
    Ok(wallet)
}

#[derive(Clone)]
pub struct SettlementEngine {
    deps: BookingDeps,
}

impl SettlementEngine {
    pub fn new(deps: BookingDeps) -> Self {
        Self { deps }
    }

    /// Records that `party` attended `slot_id` and settles the booking once every paid slot of
    /// its payment is confirmed by both sides.
    pub async fn confirm_attendance(
        &self,
        auth: &AuthContext,
        slot_id: SlotId,
        party: AttendanceParty,
        evidence_url: &str,
    ) -> Result<AttendanceOutcome, BookingError> {
        require_evidence_url(evidence_url)?;
        let now = self.deps.clock.now();

        let seen = self
            .deps
            .store
            .slot(slot_id)
            .await?
            .ok_or_else(|| BookingError::not_found("slot", slot_id))?;

        let mut tx = self.deps.store.begin().await?;
        // Siblings are locked together with the slot so concurrent confirmations on one booking
        // serialize and the last of them observes the completed state.
        let mut ids = vec![slot_id];
        if let Some(payment_id) = seen.payment_id {
            ids.extend(tx.slots_for_payment(payment_id).await?.iter().map(|s| s.id));
        }
        let mut slots = tx.lock_slots(&tutorbook_db::lock_order(&ids)).await?;

        let index = slots
            .iter()
            .position(|slot| slot.id == slot_id)
            .ok_or_else(|| BookingError::not_found("slot", slot_id))?;
        if slots[index].payment_id != seen.payment_id {
            return Err(BookingError::invalid("slot changed while confirming, please retry"));
        }

        {
            let slot = &mut slots[index];
            let allowed = match party {
                AttendanceParty::Tutor => auth.is(&slot.tutor_id),
                AttendanceParty::Learner => {
                    slot.learner_id.as_deref() == Some(auth.user_id.as_str())
                }
            };
            if !allowed {
                return Err(BookingError::unauthorized(format!(
                    "only the slot's {:?} may confirm this attendance",
                    party
                )));
            }
            if slot.status != SlotStatus::Paid {
                return Err(BookingError::SlotUnavailable(slot_id));
            }
            match party {
                AttendanceParty::Tutor => {
                    slot.tutor_joined = true;
                    slot.tutor_evidence_url = Some(evidence_url.trim().to_string());
                }
                AttendanceParty::Learner => {
                    slot.learner_joined = true;
                    slot.learner_evidence_url = Some(evidence_url.trim().to_string());
                }
            }
            tx.update_slot(slot).await?;
        }
        let slot = slots[index].clone();
        info!("{:?} confirmed attendance of slot {}", party, slot_id);

        let booking_complete = slot.payment_id.is_some()
            && slots
                .iter()
                .filter(|s| s.payment_id == slot.payment_id && s.status == SlotStatus::Paid)
                .all(Slot::is_mutually_confirmed);

        let wallet = if booking_complete {
            Some(recompute_in_tx(&mut tx, &slot.tutor_id, now).await?)
        } else {
            None
        };
        tx.commit().await?;

        if let Some(wallet) = &wallet {
            info!(
                "Booking of slot {} settled; wallet of {} is {}",
                slot_id, wallet.tutor_id, wallet.balance
            );
        }
        Ok(AttendanceOutcome {
            slot,
            settled: booking_complete,
            wallet,
        })
    }

    /// Recomputes and stores the balance of `tutor_id`. Safe to call any number of times.
    pub async fn recompute_wallet(&self, tutor_id: &str) -> Result<Wallet, BookingError> {
        let now = self.deps.clock.now();
        let mut tx = self.deps.store.begin().await?;
        let wallet = recompute_in_tx(&mut tx, tutor_id, now).await?;
        tx.commit().await?;
        info!("Recomputed wallet of {}: {}", tutor_id, wallet.balance);
        Ok(wallet)
    }

    pub async fn wallet(&self, tutor_id: &str) -> Result<Wallet, BookingError> {
        Ok(self
            .deps
            .store
            .wallet(tutor_id)
            .await?
            .unwrap_or_else(|| Wallet::empty(tutor_id)))
    }
}
