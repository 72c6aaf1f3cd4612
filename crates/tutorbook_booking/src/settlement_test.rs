use chrono::Duration;
use rust_decimal_macros::dec;
use tutorbook_common::models::{SlotId, SlotStatus, Withdrawal, WithdrawalStatus};
use tutorbook_common::services::CheckoutOutcome;
use tutorbook_db::BookingStore;

use crate::auth::AuthContext;
use crate::error::BookingError;
use crate::reservation::BookingContext;
use crate::settlement::AttendanceParty;
use crate::test_support::*;

const EVIDENCE: &str = "https://meet.example.test/recording/1";

/// Two paid one-hour slots at 40.00 booked by [`LEARNER`] in one checkout.
async fn paid_booking(h: &Harness) -> Vec<SlotId> {
    let (_, ids) = h.plan_with_slots(2).await;
    h.engine
        .reservations
        .lock_slots(&AuthContext::learner(LEARNER), &ids, BookingContext::Direct)
        .await
        .unwrap();
    h.engine
        .reservations
        .process_payment_outcome("link-1", CheckoutOutcome::Paid)
        .await
        .unwrap();
    ids
}

async fn join(h: &Harness, slot_id: SlotId, party: AttendanceParty) -> bool {
    let auth = match party {
        AttendanceParty::Tutor => AuthContext::tutor(TUTOR),
        AttendanceParty::Learner => AuthContext::learner(LEARNER),
    };
    h.engine
        .settlement
        .confirm_attendance(&auth, slot_id, party, EVIDENCE)
        .await
        .unwrap()
        .settled
}

#[tokio::test]
async fn test_wallet_credited_when_whole_booking_attended() {
    let h = Harness::new();
    let ids = paid_booking(&h).await;

    assert!(!join(&h, ids[0], AttendanceParty::Tutor).await);
    assert!(!join(&h, ids[0], AttendanceParty::Learner).await);
    assert!(!join(&h, ids[1], AttendanceParty::Tutor).await);
    assert_eq!(h.engine.settlement.wallet(TUTOR).await.unwrap().balance, dec!(0));

    assert!(join(&h, ids[1], AttendanceParty::Learner).await);
    let wallet = h.engine.settlement.wallet(TUTOR).await.unwrap();
    assert_eq!(wallet.balance, dec!(72.00));
    assert_eq!(wallet.updated_at, Some(start()));

    let slot = h.slot(ids[1]).await;
    assert!(slot.is_mutually_confirmed());
    assert_eq!(slot.learner_evidence_url.as_deref(), Some(EVIDENCE));

    // Confirming again recomputes to the same balance.
    assert!(join(&h, ids[1], AttendanceParty::Learner).await);
    assert_eq!(h.engine.settlement.wallet(TUTOR).await.unwrap().balance, dec!(72.00));
}

#[tokio::test]
async fn test_recompute_subtracts_approved_withdrawals() {
    let h = Harness::new();
    let ids = paid_booking(&h).await;
    for id in &ids {
        join(&h, *id, AttendanceParty::Tutor).await;
        join(&h, *id, AttendanceParty::Learner).await;
    }

    let mut tx = h.store.begin().await.unwrap();
    for (amount, status) in [
        (dec!(30.00), WithdrawalStatus::Approved),
        (dec!(10.00), WithdrawalStatus::Pending),
    ] {
        tx.insert_withdrawal(Withdrawal {
            id: 0,
            tutor_id: TUTOR.to_string(),
            amount,
            status,
            created_at: start(),
        })
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();

    h.clock.advance(Duration::minutes(1));
    let wallet = h.engine.settlement.recompute_wallet(TUTOR).await.unwrap();
    assert_eq!(wallet.balance, dec!(42.00));
    assert_eq!(wallet.updated_at, Some(start() + Duration::minutes(1)));
}

#[tokio::test]
async fn test_package_slots_do_not_settle() {
    let h = Harness::new();
    let (_, ids) = h.plan_with_slots(1).await;
    let package = h.package(LEARNER, 1).await;
    let learner = AuthContext::learner(LEARNER);
    h.engine
        .reservations
        .lock_slots(&learner, &ids, BookingContext::Package { package_id: package.id })
        .await
        .unwrap();
    h.engine
        .reservations
        .confirm_slots(
            &learner,
            &ids,
            crate::reservation::ConfirmTarget::Package { package_id: package.id },
        )
        .await
        .unwrap();

    assert!(!join(&h, ids[0], AttendanceParty::Tutor).await);
    assert!(!join(&h, ids[0], AttendanceParty::Learner).await);
    assert!(h.store.wallet(TUTOR).await.unwrap().is_none());
}

#[tokio::test]
async fn test_attendance_checks_party_status_and_evidence() {
    let h = Harness::new();
    let ids = paid_booking(&h).await;
    let settlement = &h.engine.settlement;

    let wrong_tutor = settlement
        .confirm_attendance(
            &AuthContext::tutor("tutor-9"),
            ids[0],
            AttendanceParty::Tutor,
            EVIDENCE,
        )
        .await;
    assert!(matches!(wrong_tutor, Err(BookingError::Unauthorized(_))));

    let wrong_learner = settlement
        .confirm_attendance(
            &AuthContext::learner(OTHER_LEARNER),
            ids[0],
            AttendanceParty::Learner,
            EVIDENCE,
        )
        .await;
    assert!(matches!(wrong_learner, Err(BookingError::Unauthorized(_))));

    let no_link = settlement
        .confirm_attendance(&AuthContext::tutor(TUTOR), ids[0], AttendanceParty::Tutor, "was there")
        .await;
    assert!(matches!(no_link, Err(BookingError::InvalidRequest(_))));

    let (_, open) = h.plan_with_slots(1).await;
    let not_paid = settlement
        .confirm_attendance(&AuthContext::tutor(TUTOR), open[0], AttendanceParty::Tutor, EVIDENCE)
        .await;
    assert!(matches!(not_paid, Err(BookingError::SlotUnavailable(_))));
    assert_eq!(h.slot(open[0]).await.status, SlotStatus::Available);
}
