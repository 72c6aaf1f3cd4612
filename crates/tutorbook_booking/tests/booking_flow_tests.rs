use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::Duration;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;
use tutorbook_booking::auth::{USER_ID_HEADER, USER_ROLE_HEADER};
use tutorbook_booking::handlers::{sign_payload, SIGNATURE_HEADER};
use tutorbook_booking::refund::Complaint;
use tutorbook_booking::routes::routes;
use tutorbook_booking::{AttendanceParty, AuthContext, BookingContext, BookingError, ConfirmTarget};
use tutorbook_common::models::{PackagePurchase, PaymentStatus, RefundStatus, SlotStatus};
use tutorbook_db::BookingStore;

async fn call(t: &fixtures::TestEngine, request: Request<Body>) -> (StatusCode, Value) {
    let response = routes(t.engine.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn as_user(method: &str, uri: &str, user: &str, role: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header(USER_ID_HEADER, user)
        .header(USER_ROLE_HEADER, role)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_direct_booking_to_settled_wallet() {
    let t = fixtures::create_test_engine();

    // Tutor publishes availability over HTTP.
    let (status, plan) = call(
        &t,
        as_user(
            "POST",
            "/plans",
            fixtures::TUTOR,
            "tutor",
            serde_json::to_value(fixtures::monday_draft()).unwrap(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let plan_id = plan["id"].as_i64().unwrap();

    let (status, slots) = call(
        &t,
        as_user(
            "POST",
            &format!("/plans/{}/slots", plan_id),
            fixtures::TUTOR,
            "tutor",
            json!({ "from": "2025-06-02", "weeks": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<i64> = slots
        .as_array()
        .unwrap()
        .iter()
        .map(|slot| slot["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids.len(), 3);

    // Learner locks two slots and gets one checkout for both.
    let (status, locked) = call(
        &t,
        as_user(
            "POST",
            "/slots/lock",
            fixtures::LEARNER,
            "learner",
            json!({ "slot_ids": &ids[..2] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(locked["payment"]["amount"], "120.00");
    let link_id = locked["checkout"]["link_id"].as_str().unwrap().to_string();

    // The gateway reports the payment.
    let event = json!({ "link_id": link_id, "status": "paid" });
    let signature = sign_payload(fixtures::WEBHOOK_SECRET, event.to_string().as_bytes()).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/payments/webhook")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(event.to_string()))
        .unwrap();
    let (status, applied) = call(&t, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(applied["payment"]["commission_amount"], "18.00");
    assert_eq!(applied["payment"]["net_amount"], "102.00");

    // Both parties attend both lessons.
    let evidence = json!({ "evidence_url": "https://meet.example.test/rec/42" });
    for id in &ids[..2] {
        let (status, _) = call(
            &t,
            as_user(
                "PATCH",
                &format!("/slots/{}/tutor-join", id),
                fixtures::TUTOR,
                "tutor",
                evidence.clone(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, outcome) = call(
            &t,
            as_user(
                "PATCH",
                &format!("/slots/{}/learner-join", id),
                fixtures::LEARNER,
                "learner",
                evidence.clone(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["settled"], *id == ids[1]);
    }

    let (status, wallet) =
        call(&t, as_user("GET", "/wallet", fixtures::TUTOR, "tutor", Value::Null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(wallet["balance"], "102.00");
    assert_eq!(t.notifier.sent_to(fixtures::TUTOR).len(), 1);
}

#[tokio::test]
async fn test_package_booking_respects_quota() {
    let t = fixtures::create_test_engine();
    let tutor = AuthContext::tutor(fixtures::TUTOR);
    let learner = AuthContext::learner(fixtures::LEARNER);
    let plan = t.engine.plans.create_plan(&tutor, fixtures::monday_draft()).await.unwrap();
    let ids: Vec<i64> = t
        .engine
        .plans
        .generate_slots(&tutor, plan.id, fixtures::date(2025, 6, 2), 1)
        .await
        .unwrap()
        .iter()
        .map(|slot| slot.id)
        .collect();

    let mut tx = t.store.begin().await.unwrap();
    let package = tx
        .insert_package(PackagePurchase {
            id: 0,
            learner_id: fixtures::LEARNER.to_string(),
            tutor_id: fixtures::TUTOR.to_string(),
            package_template_id: 3,
            payment_id: None,
            remaining: 2,
            active: true,
        })
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let context = BookingContext::Package { package_id: package.id };
    let target = ConfirmTarget::Package { package_id: package.id };
    t.engine.reservations.lock_slots(&learner, &ids, context).await.unwrap();

    let over = t.engine.reservations.confirm_slots(&learner, &ids, target).await;
    assert!(matches!(over, Err(BookingError::QuotaExceeded { requested: 3, remaining: 2 })));

    t.engine.reservations.release_slots(&learner, &ids[2..]).await.unwrap();
    let confirmed = t
        .engine
        .reservations
        .confirm_slots(&learner, &ids[..2], target)
        .await
        .unwrap();
    assert!(confirmed.iter().all(|slot| slot.status == SlotStatus::Paid));
    assert_eq!(t.store.package(package.id).await.unwrap().unwrap().remaining, 0);
    assert_eq!(t.store.slot(ids[2]).await.unwrap().unwrap().status, SlotStatus::Available);
    assert!(t.gateway.created().is_empty());
}

#[tokio::test]
async fn test_abandoned_checkout_is_swept_and_rebooked() {
    let t = fixtures::create_test_engine();
    let tutor = AuthContext::tutor(fixtures::TUTOR);
    let plan = t.engine.plans.create_plan(&tutor, fixtures::monday_draft()).await.unwrap();
    let slots = t
        .engine
        .plans
        .generate_slots(&tutor, plan.id, fixtures::date(2025, 6, 2), 1)
        .await
        .unwrap();
    let ids = vec![slots[0].id];

    let first = t
        .engine
        .reservations
        .lock_slots(&AuthContext::learner(fixtures::LEARNER), &ids, BookingContext::Direct)
        .await
        .unwrap();
    t.clock.advance(Duration::minutes(11));

    let report = t.engine.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.reclaimed, ids);
    let expired = t.store.payment(first.payment.unwrap().id).await.unwrap().unwrap();
    assert_eq!(expired.status, PaymentStatus::Expired);

    let second = t
        .engine
        .reservations
        .lock_slots(&AuthContext::learner("learner-4"), &ids, BookingContext::Direct)
        .await
        .unwrap();
    assert_eq!(second.checkout.unwrap().link_id, "link-2");
    assert_eq!(t.gateway.cancelled(), vec!["link-1".to_string()]);
}

#[tokio::test]
async fn test_disputed_lesson_is_refunded() {
    let t = fixtures::create_test_engine();
    let tutor = AuthContext::tutor(fixtures::TUTOR);
    let learner = AuthContext::learner(fixtures::LEARNER);
    let plan = t.engine.plans.create_plan(&tutor, fixtures::monday_draft()).await.unwrap();
    let slots = t
        .engine
        .plans
        .generate_slots(&tutor, plan.id, fixtures::date(2025, 6, 2), 1)
        .await
        .unwrap();
    let ids = vec![slots[1].id];

    let locked = t
        .engine
        .reservations
        .lock_slots(&learner, &ids, BookingContext::Direct)
        .await
        .unwrap();
    t.gateway.set_outcome("link-1", tutorbook_common::services::CheckoutOutcome::Paid);
    let payment_id = locked.payment.unwrap().id;
    t.engine
        .reservations
        .confirm_slots(&learner, &ids, ConfirmTarget::Payment { payment_id })
        .await
        .unwrap();

    // The tutor confirms attendance, the learner disputes instead.
    t.engine
        .settlement
        .confirm_attendance(
            &tutor,
            ids[0],
            AttendanceParty::Tutor,
            "https://meet.example.test/rec/1",
        )
        .await
        .unwrap();
    let refund = t
        .engine
        .refunds
        .learner_complain(
            &learner,
            ids[0],
            Complaint {
                evidence_url: "https://files.example.test/chat-log.png".to_string(),
                reason: Some("lesson ended after ten minutes".to_string()),
                ..Complaint::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(refund.amount, dec!(60.00));

    let approved = t
        .engine
        .refunds
        .approve(&AuthContext::admin(fixtures::ADMIN), refund.id, None)
        .await
        .unwrap();
    assert_eq!(approved.status, RefundStatus::Approved);
    assert_eq!(t.store.slot(ids[0]).await.unwrap().unwrap().status, SlotStatus::Rejected);
    assert_eq!(t.ledger.payouts()[0].amount, dec!(60.00));

    let wallet = t.engine.settlement.recompute_wallet(fixtures::TUTOR).await.unwrap();
    assert_eq!(wallet.balance, dec!(0));
}
