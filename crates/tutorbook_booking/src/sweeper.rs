// --- File: crates/tutorbook_booking/src/sweeper.rs ---
//! Periodic reclaim of abandoned holds.
//!
//! Each expired slot is handled in its own transaction under its own row lock, so a sweep
//! never blocks more than one slot at a time and races with lazy reclaim harmlessly: whoever
//! comes second finds the slot no longer lapsed and does nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use tutorbook_common::models::{Payment, PaymentId, PaymentStatus, SlotId, SlotStatus};
use tutorbook_common::services::Notification;

use crate::engine::BookingDeps;
use crate::error::BookingError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reclaimed: Vec<SlotId>,
    pub expired_payments: Vec<PaymentId>,
    pub failed: Vec<SlotId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty() && self.expired_payments.is_empty() && self.failed.is_empty()
    }
}

struct Reclaimed {
    slot_id: SlotId,
    learner_id: Option<String>,
    expired_payment: Option<Payment>,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    deps: BookingDeps,
}

impl ExpirySweeper {
    pub fn new(deps: BookingDeps) -> Self {
        Self { deps }
    }

    /// One pass over every Locked slot whose hold ended before now.
    ///
    /// Failures on single slots are logged and reported; the slot is picked up again by the next
    /// pass. Only listing the candidates can fail the pass as a whole.
    pub async fn sweep_once(&self) -> Result<SweepReport, BookingError> {
        let now = self.deps.clock.now();
        let candidates = self.deps.store.expired_locked_slots(now).await?;
        let mut report = SweepReport::default();
        if candidates.is_empty() {
            return Ok(report);
        }
        debug!("Sweeping {} expired hold(s)", candidates.len());

        let mut links = Vec::new();
        let mut learners = Vec::new();
        for slot_id in candidates {
            match self.reclaim_one(slot_id, now).await {
                Ok(Some(reclaimed)) => {
                    report.reclaimed.push(reclaimed.slot_id);
                    if let Some(payment) = reclaimed.expired_payment {
                        report.expired_payments.push(payment.id);
                        links.extend(payment.link_id);
                    }
                    learners.extend(reclaimed.learner_id);
                }
                Ok(None) => debug!("Slot {} was reclaimed concurrently", slot_id),
                Err(e) => {
                    error!("Failed to reclaim slot {}: {}", slot_id, e);
                    report.failed.push(slot_id);
                }
            }
        }

        self.deps.cancel_checkouts(&links).await;
        learners.sort();
        learners.dedup();
        for learner in learners {
            self.deps
                .notify(Notification::new(
                    &learner,
                    "Reservation expired",
                    "Your reservation expired before it was confirmed and the slot was released.",
                ))
                .await;
        }

        info!(
            "Sweep reclaimed {} slot(s), expired {} payment(s)",
            report.reclaimed.len(),
            report.expired_payments.len()
        );
        Ok(report)
    }

    async fn reclaim_one(
        &self,
        slot_id: SlotId,
        now: DateTime<Utc>,
    ) -> Result<Option<Reclaimed>, BookingError> {
        let mut tx = self.deps.store.begin().await?;
        let Some(mut slot) = tx.lock_slots(&[slot_id]).await?.pop() else {
            return Ok(None);
        };
        let lapsed = slot.status == SlotStatus::Locked
            && slot.expires_at.map_or(true, |expires_at| expires_at < now);
        if !lapsed {
            return Ok(None);
        }

        let learner_id = slot.learner_id.clone();
        let payment_id = slot.payment_id;
        slot.reclaim();
        tx.update_slot(&slot).await?;

        let mut expired_payment = None;
        if let Some(payment_id) = payment_id {
            if let Some(mut payment) = tx.lock_payment(payment_id).await? {
                if payment.status == PaymentStatus::Pending {
                    payment.status = PaymentStatus::Expired;
                    tx.update_payment(&payment).await?;
                    expired_payment = Some(payment);
                }
            }
        }
        tx.commit().await?;

        info!("Reclaimed slot {} from {:?}", slot_id, learner_id);
        Ok(Some(Reclaimed {
            slot_id,
            learner_id,
            expired_payment,
        }))
    }

    /// Runs [`sweep_once`](Self::sweep_once) every `interval` until the handle is shut down.
    pub fn spawn(self, interval: Duration) -> SweeperHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Expiry sweeper running every {:?}", interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            error!("Sweep failed, retrying next tick: {}", e);
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Expiry sweeper stopped");
        });
        SweeperHandle { shutdown, task }
    }
}

/// Cancellation handle of a spawned sweeper.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the loop after the pass in flight, if any, and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Expiry sweeper task ended abnormally: {}", e);
        }
    }
}

