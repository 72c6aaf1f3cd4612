use crate::error::DbError;
use crate::memory::MemoryStore;
use crate::store::BookingStore;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc, Weekday};
use rust_decimal_macros::dec;
use std::time::Duration as StdDuration;
use tutorbook_common::models::{
    BookingPlan, Payment, PaymentStatus, PaymentType, Slot, SlotStatus, Withdrawal,
    WithdrawalStatus,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap()
}

fn plan(tutor: &str) -> BookingPlan {
    BookingPlan {
        id: 0,
        tutor_id: tutor.to_string(),
        weekday: Weekday::Mon,
        start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        slot_minutes: 60,
        hourly_price: dec!(40.00),
        meeting_link: "https://meet.example.test/t1".to_string(),
        active: true,
    }
}

/// Commits one plan with `count` available slots and returns (plan id, slot ids).
async fn seed(store: &MemoryStore, count: i64) -> (i64, Vec<i64>) {
    let mut tx = store.begin().await.unwrap();
    let plan = tx.insert_plan(plan("tutor-1")).await.unwrap();
    let mut ids = Vec::new();
    for i in 0..count {
        let start = now() + Duration::days(1) + Duration::hours(i);
        let slot = tx
            .insert_slot(Slot::available(plan.id, "tutor-1", start, start + Duration::hours(1)))
            .await
            .unwrap();
        ids.push(slot.id);
    }
    tx.commit().await.unwrap();
    (plan.id, ids)
}

fn hold(slot: &mut Slot, learner: &str, expires_at: DateTime<Utc>) {
    slot.status = SlotStatus::Locked;
    slot.learner_id = Some(learner.to_string());
    slot.locked_at = Some(now());
    slot.expires_at = Some(expires_at);
}

#[tokio::test]
async fn test_commit_publishes_and_drop_discards() {
    let store = MemoryStore::new();
    let (_, ids) = seed(&store, 2).await;

    let mut tx = store.begin().await.unwrap();
    let mut slots = tx.lock_slots(&ids).await.unwrap();
    for slot in slots.iter_mut() {
        hold(slot, "learner-1", now() + Duration::minutes(10));
        tx.update_slot(slot).await.unwrap();
    }
    // Not visible before commit.
    assert_eq!(store.slot(ids[0]).await.unwrap().unwrap().status, SlotStatus::Available);
    drop(tx);

    assert!(store
        .all_slots()
        .iter()
        .all(|slot| slot.status == SlotStatus::Available));

    let mut tx = store.begin().await.unwrap();
    let mut slots = tx.lock_slots(&ids).await.unwrap();
    hold(&mut slots[0], "learner-1", now() + Duration::minutes(10));
    tx.update_slot(&slots[0]).await.unwrap();
    tx.commit().await.unwrap();

    let slot = store.slot(ids[0]).await.unwrap().unwrap();
    assert_eq!(slot.status, SlotStatus::Locked);
    assert_eq!(slot.learner_id.as_deref(), Some("learner-1"));
}

#[tokio::test]
async fn test_lock_slots_returns_ascending_existing_rows() {
    let store = MemoryStore::new();
    let (_, ids) = seed(&store, 3).await;

    let mut tx = store.begin().await.unwrap();
    let slots = tx
        .lock_slots(&[ids[2], 9_999, ids[0], ids[2]])
        .await
        .unwrap();
    let locked: Vec<i64> = slots.iter().map(|slot| slot.id).collect();
    assert_eq!(locked, vec![ids[0], ids[2]]);
}

#[tokio::test]
async fn test_write_without_lock_is_rejected() {
    let store = MemoryStore::new();
    let (_, ids) = seed(&store, 1).await;

    let mut slot = store.slot(ids[0]).await.unwrap().unwrap();
    hold(&mut slot, "learner-1", now() + Duration::minutes(10));

    let mut tx = store.begin().await.unwrap();
    let result = tx.update_slot(&slot).await;
    assert!(matches!(result, Err(DbError::NotLocked { entity: "slot", .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_transaction_waits_for_row_lock() {
    let store = MemoryStore::new();
    let (_, ids) = seed(&store, 1).await;
    let slot_id = ids[0];

    let mut first = store.begin().await.unwrap();
    let mut slots = first.lock_slots(&[slot_id]).await.unwrap();

    let contender = store.clone();
    let waiter = tokio::spawn(async move {
        let mut second = contender.begin().await.unwrap();
        let slots = second.lock_slots(&[slot_id]).await.unwrap();
        slots[0].status
    });

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    hold(&mut slots[0], "learner-1", now() + Duration::minutes(10));
    first.update_slot(&slots[0]).await.unwrap();
    first.commit().await.unwrap();

    // The waiter only gets the row after the first commit is visible.
    let seen = tokio::time::timeout(StdDuration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, SlotStatus::Locked);
}

#[tokio::test]
async fn test_reads_see_own_staged_writes() {
    let store = MemoryStore::new();
    let (_, ids) = seed(&store, 2).await;

    let mut tx = store.begin().await.unwrap();
    let payment = tx
        .insert_payment(Payment {
            id: 0,
            tutor_id: "tutor-1".into(),
            learner_id: "learner-1".into(),
            amount: dec!(80.00),
            payment_type: PaymentType::Booking,
            status: PaymentStatus::Pending,
            created_at: now(),
            expires_at: now() + Duration::minutes(10),
            paid_at: None,
            link_id: None,
            checkout_url: None,
            qr_url: None,
            commission_rate: None,
            commission_amount: None,
            net_amount: None,
        })
        .await
        .unwrap();
    let mut slots = tx.lock_slots(&ids).await.unwrap();
    for slot in slots.iter_mut() {
        hold(slot, "learner-1", now() + Duration::minutes(10));
        slot.payment_id = Some(payment.id);
        tx.update_slot(slot).await.unwrap();
    }

    assert_eq!(tx.slots_for_payment(payment.id).await.unwrap().len(), 2);
    assert!(tx.paid_booking_payments("tutor-1").await.unwrap().is_empty());
    assert!(store.payment(payment.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_scan_is_strictly_before_now() {
    let store = MemoryStore::new();
    let (_, ids) = seed(&store, 2).await;

    let mut tx = store.begin().await.unwrap();
    let mut slots = tx.lock_slots(&ids).await.unwrap();
    hold(&mut slots[0], "learner-1", now());
    hold(&mut slots[1], "learner-2", now() - Duration::seconds(1));
    tx.update_slot(&slots[0]).await.unwrap();
    tx.update_slot(&slots[1]).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(store.expired_locked_slots(now()).await.unwrap(), vec![ids[1]]);
}

#[tokio::test]
async fn test_delete_plan_cascades_to_slots() {
    let store = MemoryStore::new();
    let (plan_id, ids) = seed(&store, 3).await;

    let mut tx = store.begin().await.unwrap();
    tx.lock_plan(plan_id).await.unwrap().unwrap();
    tx.lock_slots(&ids).await.unwrap();
    tx.delete_plan(plan_id).await.unwrap();
    tx.commit().await.unwrap();

    assert!(store.plan(plan_id).await.unwrap().is_none());
    assert!(store.slots_for_plan(plan_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_plan_requires_every_slot_lock() {
    let store = MemoryStore::new();
    let (plan_id, ids) = seed(&store, 2).await;

    let mut tx = store.begin().await.unwrap();
    tx.lock_plan(plan_id).await.unwrap().unwrap();
    tx.lock_slots(&ids[..1]).await.unwrap();
    let result = tx.delete_plan(plan_id).await;
    assert!(matches!(result, Err(DbError::NotLocked { entity: "slot", .. })));
    drop(tx);

    assert!(store.plan(plan_id).await.unwrap().is_some());
    assert_eq!(store.slots_for_plan(plan_id).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plan_delete_waits_for_held_slot() {
    let store = MemoryStore::new();
    let (plan_id, ids) = seed(&store, 1).await;

    let mut holder = store.begin().await.unwrap();
    let mut slots = holder.lock_slots(&ids).await.unwrap();

    let deleter = store.clone();
    let slot_ids = ids.clone();
    let delete = tokio::spawn(async move {
        let mut tx = deleter.begin().await.unwrap();
        tx.lock_plan(plan_id).await.unwrap().unwrap();
        tx.lock_slots(&slot_ids).await.unwrap();
        tx.delete_plan(plan_id).await.unwrap();
        tx.commit().await.unwrap();
    });

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(!delete.is_finished());
    assert!(store.plan(plan_id).await.unwrap().is_some());

    hold(&mut slots[0], "learner-1", now() + Duration::minutes(10));
    holder.update_slot(&slots[0]).await.unwrap();
    holder.commit().await.unwrap();

    tokio::time::timeout(StdDuration::from_secs(2), delete)
        .await
        .unwrap()
        .unwrap();
    assert!(store.plan(plan_id).await.unwrap().is_none());
    assert!(store.slot(ids[0]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_wallet_and_withdrawals() {
    let store = MemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    for (amount, status) in [
        (dec!(20.00), WithdrawalStatus::Approved),
        (dec!(5.50), WithdrawalStatus::Approved),
        (dec!(100.00), WithdrawalStatus::Pending),
    ] {
        tx.insert_withdrawal(Withdrawal {
            id: 0,
            tutor_id: "tutor-1".into(),
            amount,
            status,
            created_at: now(),
        })
        .await
        .unwrap();
    }
    assert_eq!(tx.approved_withdrawal_total("tutor-1").await.unwrap(), dec!(25.50));

    let mut wallet = tx.lock_wallet("tutor-1").await.unwrap();
    assert_eq!(wallet.balance, dec!(0));
    wallet.balance = dec!(12.00);
    tx.save_wallet(&wallet).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(store.wallet("tutor-1").await.unwrap().unwrap().balance, dec!(12.00));
}
