// --- File: crates/tutorbook_booking/src/plans.rs ---
//! Tutors' weekly availability templates and the slots materialized from them.
//!
//! Create and update hold the tutor's serializing lock while they check the weekday cap and
//! overlapping windows, so two concurrent edits cannot together exceed the cap.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};
use tutorbook_common::models::{
    BookingPlan, PaymentStatus, PlanId, RefundRequest, Slot, SlotId, SlotStatus,
};
use tutorbook_common::services::Notification;
use tutorbook_db::BookingTx;

use crate::auth::{AuthContext, Role};
use crate::engine::BookingDeps;
use crate::error::BookingError;
use crate::refund::{announce_invalidation, invalidate_in_tx};
use crate::reservation::close_orphaned_payments;

/// Longest horizon slots are generated for in one call.
pub const MAX_GENERATION_WEEKS: u32 = 12;

fn default_active() -> bool {
    true
}

/// Tutor-supplied fields of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub weekday: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_minutes: i64,
    pub hourly_price: Decimal,
    pub meeting_link: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl PlanDraft {
    fn validate(&self) -> Result<(), BookingError> {
        if self.start_time >= self.end_time {
            return Err(BookingError::InvalidTimeRange(format!(
                "start {} must be before end {}",
                self.start_time, self.end_time
            )));
        }
        let window = (self.end_time - self.start_time).num_minutes();
        if self.slot_minutes <= 0 || self.slot_minutes > window {
            return Err(BookingError::InvalidTimeRange(format!(
                "slot length {} min does not fit a {} min window",
                self.slot_minutes, window
            )));
        }
        if self.hourly_price <= Decimal::ZERO {
            return Err(BookingError::InvalidTimeRange(
                "hourly price must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn into_plan(self, id: PlanId, tutor_id: &str) -> BookingPlan {
        BookingPlan {
            id,
            tutor_id: tutor_id.to_string(),
            weekday: self.weekday,
            start_time: self.start_time,
            end_time: self.end_time,
            slot_minutes: self.slot_minutes,
            hourly_price: self.hourly_price,
            meeting_link: self.meeting_link,
            active: self.active,
        }
    }
}

/// What a plan edit did to already materialized slots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanChange {
    pub plan: Option<BookingPlan>,
    pub removed_slots: Vec<SlotId>,
    pub released_slots: Vec<SlotId>,
    pub refunds: Vec<RefundRequest>,
}

/// Side effects of an invalidation that run after commit.
#[derive(Debug, Default)]
struct Followups {
    links: Vec<String>,
    released: Vec<(String, SlotId)>,
}

/// Whether `slot` still lies inside the plan window, read in the plan's zone.
fn slot_fits(slot: &Slot, plan: &BookingPlan, zone: Tz) -> bool {
    let start = slot.start_time.with_timezone(&zone);
    let end = slot.end_time.with_timezone(&zone);
    start.weekday() == plan.weekday
        && start.date_naive() == end.date_naive()
        && start.time() >= plan.start_time
        && end.time() <= plan.end_time
}

/// Converts a local wall-clock time to UTC. Times skipped by a DST jump have no instant.
fn to_utc(zone: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    zone.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Enforces the weekday cap and the no-overlap rule against the tutor's other plans.
fn check_against_siblings(
    draft: &PlanDraft,
    siblings: &[BookingPlan],
    max_weekly_days: usize,
) -> Result<(), BookingError> {
    let mut weekdays: HashSet<Weekday> = siblings.iter().map(|plan| plan.weekday).collect();
    weekdays.insert(draft.weekday);
    if weekdays.len() > max_weekly_days {
        return Err(BookingError::MaxWeeklyDaysExceeded {
            max: max_weekly_days,
        });
    }
    if let Some(clash) = siblings.iter().find(|plan| {
        plan.weekday == draft.weekday && plan.window_overlaps(draft.start_time, draft.end_time)
    }) {
        return Err(BookingError::BookingTimeConflict(format!(
            "{} {}-{} overlaps plan {}",
            draft.weekday, draft.start_time, draft.end_time, clash.id
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct BookingPlanCatalog {
    deps: BookingDeps,
}

impl BookingPlanCatalog {
    pub fn new(deps: BookingDeps) -> Self {
        Self { deps }
    }

    async fn gate(&self, auth: &AuthContext) -> Result<(), BookingError> {
        if auth.role != Role::Tutor {
            return Err(BookingError::unauthorized("only tutors manage booking plans"));
        }
        self.deps.ensure_tutor_in_good_standing(&auth.user_id).await
    }

    pub async fn create_plan(
        &self,
        auth: &AuthContext,
        draft: PlanDraft,
    ) -> Result<BookingPlan, BookingError> {
        self.gate(auth).await?;
        draft.validate()?;

        let mut tx = self.deps.store.begin().await?;
        tx.lock_tutor(&auth.user_id).await?;
        let siblings = tx.plans_for_tutor(&auth.user_id).await?;
        check_against_siblings(&draft, &siblings, self.deps.settings.max_weekly_days)?;

        let plan = tx.insert_plan(draft.into_plan(0, &auth.user_id)).await?;
        tx.commit().await?;
        info!(
            "Tutor {} created plan {} ({} {}-{})",
            auth.user_id, plan.id, plan.weekday, plan.start_time, plan.end_time
        );
        Ok(plan)
    }

    /// Replaces a plan. Future slots that fall outside the new window are invalidated: free
    /// ones are removed, held ones released, paid ones rejected with a refund.
    pub async fn update_plan(
        &self,
        auth: &AuthContext,
        plan_id: PlanId,
        draft: PlanDraft,
    ) -> Result<PlanChange, BookingError> {
        self.gate(auth).await?;
        draft.validate()?;
        let now = self.deps.clock.now();

        let mut tx = self.deps.store.begin().await?;
        tx.lock_tutor(&auth.user_id).await?;
        let current = self.owned_plan(&mut tx, auth, plan_id).await?;
        let siblings: Vec<BookingPlan> = tx
            .plans_for_tutor(&auth.user_id)
            .await?
            .into_iter()
            .filter(|plan| plan.id != current.id)
            .collect();
        check_against_siblings(&draft, &siblings, self.deps.settings.max_weekly_days)?;

        let plan = draft.into_plan(plan_id, &auth.user_id);
        let zone = self.deps.settings.time_zone;
        let stale: Vec<SlotId> = tx
            .slots_for_plan(plan_id)
            .await?
            .iter()
            .filter(|slot| slot.start_time > now && !slot_fits(slot, &plan, zone))
            .map(|slot| slot.id)
            .collect();
        // Refunds are priced before the new rate is staged.
        let (mut change, followups) = self.invalidate(&mut tx, &stale, now).await?;
        tx.update_plan(&plan).await?;
        tx.commit().await?;

        info!(
            "Tutor {} updated plan {}: removed {:?}, released {:?}, {} refund(s)",
            auth.user_id,
            plan_id,
            change.removed_slots,
            change.released_slots,
            change.refunds.len()
        );
        self.after_invalidation(&change, followups).await;
        change.plan = Some(plan);
        Ok(change)
    }

    /// Deletes a plan and, with it, all of its slots. Future paid slots get a refund first.
    pub async fn delete_plan(
        &self,
        auth: &AuthContext,
        plan_id: PlanId,
    ) -> Result<PlanChange, BookingError> {
        self.gate(auth).await?;
        let now = self.deps.clock.now();

        let mut tx = self.deps.store.begin().await?;
        tx.lock_tutor(&auth.user_id).await?;
        self.owned_plan(&mut tx, auth, plan_id).await?;

        // Every slot row goes with the plan, past ones included.
        let all: Vec<SlotId> = tx
            .slots_for_plan(plan_id)
            .await?
            .iter()
            .map(|slot| slot.id)
            .collect();
        let future: Vec<SlotId> = tx
            .lock_slots(&all)
            .await?
            .iter()
            .filter(|slot| slot.start_time > now)
            .map(|slot| slot.id)
            .collect();
        let (change, followups) = self.invalidate(&mut tx, &future, now).await?;
        tx.delete_plan(plan_id).await?;
        tx.commit().await?;

        info!("Tutor {} deleted plan {}", auth.user_id, plan_id);
        self.after_invalidation(&change, followups).await;
        Ok(change)
    }

    pub async fn list_plans(&self, tutor_id: &str) -> Result<Vec<BookingPlan>, BookingError> {
        Ok(self.deps.store.plans_for_tutor(tutor_id).await?)
    }

    pub async fn plan_slots(&self, plan_id: PlanId) -> Result<Vec<Slot>, BookingError> {
        Ok(self.deps.store.slots_for_plan(plan_id).await?)
    }

    /// Materializes the plan's future slots for `weeks` weeks starting at `from`, in the
    /// configured zone. Slots that already exist are skipped, so repeating a call is harmless.
    pub async fn generate_slots(
        &self,
        auth: &AuthContext,
        plan_id: PlanId,
        from: NaiveDate,
        weeks: u32,
    ) -> Result<Vec<Slot>, BookingError> {
        if weeks == 0 || weeks > MAX_GENERATION_WEEKS {
            return Err(BookingError::invalid(format!(
                "weeks must be between 1 and {}",
                MAX_GENERATION_WEEKS
            )));
        }
        self.gate(auth).await?;
        let now = self.deps.clock.now();
        let zone = self.deps.settings.time_zone;

        let mut tx = self.deps.store.begin().await?;
        let plan = self.owned_plan(&mut tx, auth, plan_id).await?;
        if !plan.active {
            return Err(BookingError::invalid(format!("plan {} is not active", plan_id)));
        }

        let existing: HashSet<DateTime<Utc>> = tx
            .slots_for_plan(plan_id)
            .await?
            .iter()
            .map(|slot| slot.start_time)
            .collect();
        let length = Duration::minutes(plan.slot_minutes);

        let mut created = Vec::new();
        let days = i64::from(weeks) * 7;
        for date in from.iter_days().take(days as usize) {
            if date.weekday() != plan.weekday {
                continue;
            }
            let mut cursor = plan.start_time;
            loop {
                let (next, wrapped) = cursor.overflowing_add_signed(length);
                if wrapped != 0 || next > plan.end_time {
                    break;
                }
                match (to_utc(zone, date, cursor), to_utc(zone, date, next)) {
                    (Some(start), Some(end)) if start > now && !existing.contains(&start) => {
                        let slot = tx
                            .insert_slot(Slot::available(plan.id, &plan.tutor_id, start, end))
                            .await?;
                        created.push(slot);
                    }
                    (None, _) | (_, None) => {
                        warn!("Skipping {} {} in {}: no such local time", date, cursor, zone)
                    }
                    _ => {}
                }
                cursor = next;
            }
        }
        tx.commit().await?;
        info!(
            "Generated {} slot(s) for plan {} from {}",
            created.len(),
            plan_id,
            from
        );
        Ok(created)
    }

    async fn owned_plan(
        &self,
        tx: &mut Box<dyn BookingTx>,
        auth: &AuthContext,
        plan_id: PlanId,
    ) -> Result<BookingPlan, BookingError> {
        let plan = tx
            .lock_plan(plan_id)
            .await?
            .ok_or_else(|| BookingError::not_found("plan", plan_id))?;
        if !auth.is(&plan.tutor_id) {
            return Err(BookingError::unauthorized("plan belongs to another tutor"));
        }
        Ok(plan)
    }

    /// Routes slots removed from a plan through invalidation.
    async fn invalidate(
        &self,
        tx: &mut Box<dyn BookingTx>,
        slot_ids: &[SlotId],
        now: DateTime<Utc>,
    ) -> Result<(PlanChange, Followups), BookingError> {
        let mut change = PlanChange::default();
        let mut followups = Followups::default();
        if slot_ids.is_empty() {
            return Ok((change, followups));
        }

        let mut slots = tx.lock_slots(slot_ids).await?;
        let mut payments = BTreeSet::new();
        for slot in slots.iter_mut() {
            match slot.status {
                SlotStatus::Available => {
                    tx.delete_slot(slot.id).await?;
                    change.removed_slots.push(slot.id);
                }
                SlotStatus::Locked => {
                    payments.extend(slot.payment_id);
                    if let Some(learner_id) = slot.learner_id.clone() {
                        followups.released.push((learner_id, slot.id));
                    }
                    slot.reclaim();
                    tx.update_slot(slot).await?;
                    change.released_slots.push(slot.id);
                }
                SlotStatus::Paid => {
                    let note = Some("time window removed from the tutor's plan".to_string());
                    if let Some(refund) = invalidate_in_tx(tx, slot, note, now).await? {
                        change.refunds.push(refund);
                    }
                }
                SlotStatus::Rejected => debug!("Slot {} is already rejected", slot.id),
            }
        }
        followups.links = close_orphaned_payments(tx, &payments, PaymentStatus::Cancelled).await?;
        Ok((change, followups))
    }

    async fn after_invalidation(&self, change: &PlanChange, followups: Followups) {
        self.deps.cancel_checkouts(&followups.links).await;
        for refund in &change.refunds {
            announce_invalidation(&self.deps, refund).await;
        }
        for (learner_id, slot_id) in followups.released {
            self.deps
                .notify(Notification::new(
                    &learner_id,
                    "Reservation cancelled",
                    format!("Slot {} is no longer offered by the tutor.", slot_id),
                ))
                .await;
        }
    }
}
