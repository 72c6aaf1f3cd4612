use chrono::{NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use rust_decimal_macros::dec;
use std::time::Duration as StdDuration;
use tutorbook_common::models::{PaymentStatus, RefundReason, SlotId, SlotStatus};
use tutorbook_common::services::{CheckoutOutcome, TutorStanding};
use tutorbook_db::BookingStore;

use crate::auth::AuthContext;
use crate::engine::BookingSettings;
use crate::error::BookingError;
use crate::plans::PlanDraft;
use crate::reservation::BookingContext;
use crate::test_support::*;

fn draft(weekday: Weekday, start: NaiveTime, end: NaiveTime) -> PlanDraft {
    PlanDraft {
        weekday,
        start_time: start,
        end_time: end,
        slot_minutes: 60,
        hourly_price: dec!(40.00),
        meeting_link: "https://meet.example.test/tutor-1".to_string(),
        active: true,
    }
}

fn tutor() -> AuthContext {
    AuthContext::tutor(TUTOR)
}

fn march(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
}

#[tokio::test]
async fn test_weekday_cap() {
    let h = Harness::new();
    let plans = &h.engine.plans;
    for weekday in [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu] {
        plans.create_plan(&tutor(), draft(weekday, hm(9, 0), hm(12, 0))).await.unwrap();
    }

    let fifth = plans.create_plan(&tutor(), draft(Weekday::Fri, hm(9, 0), hm(12, 0))).await;
    assert!(matches!(fifth, Err(BookingError::MaxWeeklyDaysExceeded { max: 4 })));

    // A second window on a day already in use does not count against the cap.
    plans
        .create_plan(&tutor(), draft(Weekday::Mon, hm(14, 0), hm(16, 0)))
        .await
        .unwrap();
    assert_eq!(plans.list_plans(TUTOR).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_overlapping_windows_conflict() {
    let h = Harness::new();
    let plans = &h.engine.plans;
    plans.create_plan(&tutor(), draft(Weekday::Mon, hm(9, 0), hm(12, 0))).await.unwrap();

    let overlap = plans.create_plan(&tutor(), draft(Weekday::Mon, hm(11, 0), hm(13, 0))).await;
    assert!(matches!(overlap, Err(BookingError::BookingTimeConflict(_))));

    // Touching windows do not overlap.
    plans.create_plan(&tutor(), draft(Weekday::Mon, hm(12, 0), hm(13, 0))).await.unwrap();
}

#[tokio::test]
async fn test_draft_validation_and_gate() {
    let h = Harness::new();
    let plans = &h.engine.plans;

    let backwards = plans.create_plan(&tutor(), draft(Weekday::Mon, hm(12, 0), hm(9, 0))).await;
    assert!(matches!(backwards, Err(BookingError::InvalidTimeRange(_))));

    let mut long = draft(Weekday::Mon, hm(9, 0), hm(9, 30));
    long.slot_minutes = 60;
    assert!(matches!(
        plans.create_plan(&tutor(), long).await,
        Err(BookingError::InvalidTimeRange(_))
    ));

    let learner = plans
        .create_plan(&AuthContext::learner(LEARNER), draft(Weekday::Mon, hm(9, 0), hm(12, 0)))
        .await;
    assert!(matches!(learner, Err(BookingError::Unauthorized(_))));

    h.directory.set_standing(TUTOR, TutorStanding::Suspended);
    let suspended = plans.create_plan(&tutor(), draft(Weekday::Mon, hm(9, 0), hm(12, 0))).await;
    assert!(matches!(suspended, Err(BookingError::TutorSuspended(_))));

    h.directory.set_standing(TUTOR, TutorStanding::NotApproved);
    let pending = plans.create_plan(&tutor(), draft(Weekday::Mon, hm(9, 0), hm(12, 0))).await;
    assert!(matches!(pending, Err(BookingError::TutorNotApproved(_))));
    assert!(plans.list_plans(TUTOR).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_generate_slots_is_idempotent() {
    let h = Harness::new();
    let plans = &h.engine.plans;
    let plan = plans
        .create_plan(&tutor(), draft(Weekday::Mon, hm(9, 0), hm(12, 0)))
        .await
        .unwrap();

    let created = plans.generate_slots(&tutor(), plan.id, march(3), 2).await.unwrap();
    assert_eq!(created.len(), 6);
    assert_eq!(created[0].start_time, Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap());
    assert_eq!(created[5].end_time, Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap());
    assert!(created.iter().all(|slot| slot.status == SlotStatus::Available));

    assert!(plans.generate_slots(&tutor(), plan.id, march(3), 2).await.unwrap().is_empty());
    assert_eq!(plans.plan_slots(plan.id).await.unwrap().len(), 6);

    let too_far = plans.generate_slots(&tutor(), plan.id, march(3), 13).await;
    assert!(matches!(too_far, Err(BookingError::InvalidRequest(_))));
    let foreign = plans
        .generate_slots(&AuthContext::tutor("tutor-9"), plan.id, march(3), 1)
        .await;
    assert!(matches!(foreign, Err(BookingError::Unauthorized(_))));
}

#[tokio::test]
async fn test_generate_slots_in_local_zone() {
    let h = Harness::with_settings(BookingSettings {
        time_zone: Tz::Europe__Zurich,
        ..BookingSettings::default()
    });
    let plans = &h.engine.plans;
    let plan = plans
        .create_plan(&tutor(), draft(Weekday::Mon, hm(9, 0), hm(12, 0)))
        .await
        .unwrap();

    // 09:00 in Zurich is 08:00 UTC in March, which is not after now.
    let created = plans.generate_slots(&tutor(), plan.id, march(3), 2).await.unwrap();
    assert_eq!(created.len(), 5);
    assert_eq!(created[0].start_time, Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap());
    assert_eq!(created[2].start_time, Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap());
}

/// A Monday 09:00-17:00 plan with next Monday's eight slots; slot 0 paid by [`LEARNER`],
/// slot 1 held by [`OTHER_LEARNER`].
async fn busy_plan(h: &Harness) -> (i64, Vec<SlotId>) {
    let plan = h
        .engine
        .plans
        .create_plan(&tutor(), draft(Weekday::Mon, hm(9, 0), hm(17, 0)))
        .await
        .unwrap();
    let ids: Vec<SlotId> = h
        .engine
        .plans
        .generate_slots(&tutor(), plan.id, march(10), 1)
        .await
        .unwrap()
        .iter()
        .map(|slot| slot.id)
        .collect();
    assert_eq!(ids.len(), 8);

    h.engine
        .reservations
        .lock_slots(&AuthContext::learner(LEARNER), &ids[..1], BookingContext::Direct)
        .await
        .unwrap();
    h.engine
        .reservations
        .process_payment_outcome("link-1", CheckoutOutcome::Paid)
        .await
        .unwrap();
    h.engine
        .reservations
        .lock_slots(&AuthContext::learner(OTHER_LEARNER), &ids[1..2], BookingContext::Direct)
        .await
        .unwrap();
    (plan.id, ids)
}

#[tokio::test]
async fn test_update_invalidates_slots_outside_new_window() {
    let h = Harness::new();
    let (plan_id, ids) = busy_plan(&h).await;

    let mut narrower = draft(Weekday::Mon, hm(11, 0), hm(16, 0));
    narrower.hourly_price = dec!(50.00);
    let change = h.engine.plans.update_plan(&tutor(), plan_id, narrower).await.unwrap();

    assert_eq!(change.removed_slots, vec![ids[7]]);
    assert_eq!(change.released_slots, vec![ids[1]]);
    assert_eq!(change.refunds.len(), 1);
    let refund = &change.refunds[0];
    assert_eq!(refund.slot_id, ids[0]);
    assert_eq!(refund.reason, RefundReason::PlanChanged);
    assert_eq!(refund.amount, dec!(40.00));

    assert_eq!(h.slot(ids[0]).await.status, SlotStatus::Rejected);
    let released = h.slot(ids[1]).await;
    assert_eq!(released.status, SlotStatus::Available);
    assert!(released.learner_id.is_none());
    assert!(h.store.slot(ids[7]).await.unwrap().is_none());
    assert_eq!(h.slot(ids[2]).await.status, SlotStatus::Available);

    let held_payment = h.store.payment_by_link("link-2").await.unwrap().unwrap();
    assert_eq!(held_payment.status, PaymentStatus::Cancelled);
    assert_eq!(h.gateway.cancelled(), vec!["link-2".to_string()]);

    assert_eq!(
        h.notifier.sent_to(LEARNER).last().unwrap().subject,
        "Lesson cancelled by tutor"
    );
    assert_eq!(
        h.notifier.sent_to(OTHER_LEARNER).last().unwrap().subject,
        "Reservation cancelled"
    );
    assert_eq!(
        h.store.plan(plan_id).await.unwrap().unwrap().hourly_price,
        dec!(50.00)
    );
    h.assert_invariants();
}

#[tokio::test]
async fn test_delete_plan_refunds_and_cascades() {
    let h = Harness::new();
    let (plan_id, ids) = busy_plan(&h).await;

    let foreign = h.engine.plans.delete_plan(&AuthContext::tutor("tutor-9"), plan_id).await;
    assert!(matches!(foreign, Err(BookingError::Unauthorized(_))));

    let change = h.engine.plans.delete_plan(&tutor(), plan_id).await.unwrap();
    assert_eq!(change.removed_slots.len(), 6);
    assert_eq!(change.released_slots, vec![ids[1]]);
    assert_eq!(change.refunds.len(), 1);

    assert!(h.store.plan(plan_id).await.unwrap().is_none());
    assert!(h.store.slots_for_plan(plan_id).await.unwrap().is_empty());
    let refunds = h
        .engine
        .refunds
        .list_refunds(&AuthContext::admin(ADMIN), None)
        .await
        .unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].slot_id, ids[0]);

    let missing = h.engine.plans.delete_plan(&tutor(), plan_id).await;
    assert!(matches!(missing, Err(BookingError::NotFound(_))));
}

#[tokio::test]
async fn test_delete_plan_waits_for_slot_in_use() {
    let h = Harness::new();
    let (plan, ids) = h.plan_with_slots(2).await;

    let mut holder = h.store.begin().await.unwrap();
    holder.lock_slots(&ids[1..]).await.unwrap();

    let tutor_user = tutor();
    let delete = h.engine.plans.delete_plan(&tutor_user, plan.id);
    tokio::pin!(delete);
    let blocked = tokio::time::timeout(StdDuration::from_millis(50), &mut delete).await;
    assert!(blocked.is_err());
    assert!(h.store.plan(plan.id).await.unwrap().is_some());
    assert_eq!(h.store.slots_for_plan(plan.id).await.unwrap().len(), 2);

    drop(holder);
    let change = delete.await.unwrap();
    assert_eq!(change.removed_slots, ids);
    assert!(h.store.plan(plan.id).await.unwrap().is_none());
    assert!(h.store.slots_for_plan(plan.id).await.unwrap().is_empty());
}
