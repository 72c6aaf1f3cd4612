// --- File: crates/tutorbook_booking/src/routes.rs ---

use crate::engine::BookingEngine;
use crate::handlers::{
    approve_refund_handler, complain_handler, confirm_slots_handler, create_plan_handler,
    delete_plan_handler, generate_slots_handler, get_payment_handler, get_slot_handler,
    health_handler, learner_join_handler, list_plans_handler, list_refunds_handler,
    lock_slots_handler, payment_webhook_handler, plan_slots_handler, reject_refund_handler,
    release_slots_handler, tutor_join_handler, update_plan_handler, wallet_handler, BookingState,
};
use axum::{
    routing::{get, patch, post, put},
    Router,
};
use std::sync::Arc;

/// Creates a router containing every booking route. Mount it under `/api`.
pub fn routes(engine: Arc<BookingEngine>) -> Router {
    let state = BookingState { engine };

    Router::new()
        .route("/health", get(health_handler))
        // Reservation
        .route("/slots/lock", post(lock_slots_handler))
        .route("/slots/confirm", post(confirm_slots_handler))
        .route("/slots/release", post(release_slots_handler))
        .route("/slots/{slot_id}", get(get_slot_handler))
        // Attendance & disputes
        .route("/slots/{slot_id}/tutor-join", patch(tutor_join_handler))
        .route("/slots/{slot_id}/learner-join", patch(learner_join_handler))
        .route("/slots/{slot_id}/complain", post(complain_handler))
        // Payments
        .route("/payments/webhook", post(payment_webhook_handler))
        .route("/payments/{payment_id}", get(get_payment_handler))
        // Plans
        .route("/plans", get(list_plans_handler).post(create_plan_handler))
        .route(
            "/plans/{plan_id}",
            put(update_plan_handler).delete(delete_plan_handler),
        )
        .route(
            "/plans/{plan_id}/slots",
            get(plan_slots_handler).post(generate_slots_handler),
        )
        .route("/wallet", get(wallet_handler))
        // Admin
        .route("/admin/refunds", get(list_refunds_handler))
        .route(
            "/admin/refunds/{refund_id}/approve",
            post(approve_refund_handler),
        )
        .route(
            "/admin/refunds/{refund_id}/reject",
            post(reject_refund_handler),
        )
        .with_state(state)
}
