// --- File: crates/tutorbook_booking/src/handlers.rs ---
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
};
use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, warn};
use tutorbook_common::models::{
    BookingPlan, Payment, PaymentId, PlanId, RefundId, RefundRequest, RefundStatus, Slot, SlotId,
    Wallet,
};
use tutorbook_common::services::CheckoutOutcome;
use tutorbook_common::{log_result, TutorbookError};

use crate::auth::AuthContext;
use crate::engine::BookingEngine;
use crate::plans::{PlanChange, PlanDraft};
use crate::refund::Complaint;
use crate::reservation::{BookingContext, ConfirmTarget, LockOutcome, OutcomeApplied};
use crate::settlement::{AttendanceOutcome, AttendanceParty};

pub const SIGNATURE_HEADER: &str = "x-tutorbook-signature";

/// Shared state of the booking routes.
#[derive(Clone)]
pub struct BookingState {
    pub engine: Arc<BookingEngine>,
}

// --- Request & response bodies ---

#[derive(Debug, Deserialize, Serialize)]
pub struct LockRequest {
    pub slot_ids: Vec<SlotId>,
    #[serde(default)]
    pub package_id: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ConfirmRequest {
    pub slot_ids: Vec<SlotId>,
    #[serde(default)]
    pub payment_id: Option<PaymentId>,
    #[serde(default)]
    pub package_id: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReleaseRequest {
    pub slot_ids: Vec<SlotId>,
}

#[derive(Debug, Serialize)]
pub struct SlotsResponse {
    pub success: bool,
    pub message: String,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Serialize)]
pub struct LockResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub outcome: LockOutcome,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EvidenceRequest {
    pub evidence_url: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GenerateSlotsRequest {
    pub from: NaiveDate,
    pub weeks: u32,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DecisionRequest {
    #[serde(default)]
    pub admin_note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefundListQuery {
    #[serde(default)]
    pub status: Option<RefundStatus>,
}

#[derive(Debug, Deserialize)]
pub struct PlanListQuery {
    #[serde(default)]
    pub tutor_id: Option<String>,
}

/// Gateway-neutral payment notification.
#[derive(Debug, Deserialize, Serialize)]
pub struct PaymentWebhook {
    pub link_id: String,
    pub status: CheckoutOutcome,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: bool,
}

// --- Webhook signature ---

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, TutorbookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| TutorbookError::InternalError(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// --- Slot handlers ---

pub async fn lock_slots_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Json(request): Json<LockRequest>,
) -> Result<Json<LockResponse>, TutorbookError> {
    let context = match request.package_id {
        Some(package_id) => BookingContext::Package { package_id },
        None => BookingContext::Direct,
    };
    let outcome = state
        .engine
        .reservations
        .lock_slots(&auth, &request.slot_ids, context)
        .await?;
    Ok(Json(LockResponse {
        success: true,
        message: format!("{} slot(s) locked", outcome.slots.len()),
        outcome,
    }))
}

pub async fn confirm_slots_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<SlotsResponse>, TutorbookError> {
    let target = match (request.payment_id, request.package_id) {
        (Some(payment_id), None) => ConfirmTarget::Payment { payment_id },
        (None, Some(package_id)) => ConfirmTarget::Package { package_id },
        _ => {
            return Err(TutorbookError::ValidationError(
                "exactly one of payment_id or package_id is required".to_string(),
            ))
        }
    };
    let slots = state
        .engine
        .reservations
        .confirm_slots(&auth, &request.slot_ids, target)
        .await?;
    Ok(Json(SlotsResponse {
        success: true,
        message: format!("{} slot(s) confirmed", slots.len()),
        slots,
    }))
}

pub async fn release_slots_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Json(request): Json<ReleaseRequest>,
) -> Result<Json<SlotsResponse>, TutorbookError> {
    let slots = state
        .engine
        .reservations
        .release_slots(&auth, &request.slot_ids)
        .await?;
    Ok(Json(SlotsResponse {
        success: true,
        message: format!("{} slot(s) released", slots.len()),
        slots,
    }))
}

pub async fn get_slot_handler(
    State(state): State<BookingState>,
    _auth: AuthContext,
    Path(slot_id): Path<SlotId>,
) -> Result<Json<Slot>, TutorbookError> {
    Ok(Json(state.engine.reservations.slot(slot_id).await?))
}

async fn confirm_attendance(
    state: BookingState,
    auth: AuthContext,
    slot_id: SlotId,
    party: AttendanceParty,
    evidence_url: &str,
) -> Result<Json<AttendanceOutcome>, TutorbookError> {
    let outcome = state
        .engine
        .settlement
        .confirm_attendance(&auth, slot_id, party, evidence_url)
        .await?;
    Ok(Json(outcome))
}

pub async fn tutor_join_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Path(slot_id): Path<SlotId>,
    Json(request): Json<EvidenceRequest>,
) -> Result<Json<AttendanceOutcome>, TutorbookError> {
    confirm_attendance(state, auth, slot_id, AttendanceParty::Tutor, &request.evidence_url).await
}

pub async fn learner_join_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Path(slot_id): Path<SlotId>,
    Json(request): Json<EvidenceRequest>,
) -> Result<Json<AttendanceOutcome>, TutorbookError> {
    confirm_attendance(state, auth, slot_id, AttendanceParty::Learner, &request.evidence_url).await
}

pub async fn complain_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Path(slot_id): Path<SlotId>,
    Json(complaint): Json<Complaint>,
) -> Result<Json<RefundRequest>, TutorbookError> {
    let refund = state
        .engine
        .refunds
        .learner_complain(&auth, slot_id, complaint)
        .await?;
    Ok(Json(refund))
}

// --- Payments ---

pub async fn payment_webhook_handler(
    State(state): State<BookingState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OutcomeApplied>, TutorbookError> {
    let secret = state
        .engine
        .deps
        .settings
        .webhook_secret
        .as_deref()
        .ok_or_else(|| {
            warn!("Payment webhook called but no webhook secret is configured");
            TutorbookError::ConfigError("webhook secret is not configured".to_string())
        })?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| TutorbookError::AuthError("missing webhook signature".to_string()))?;
    if !verify_signature(secret, &body, signature) {
        warn!("Rejected payment webhook with a bad signature");
        return Err(TutorbookError::AuthError("invalid webhook signature".to_string()));
    }

    let event: PaymentWebhook = serde_json::from_slice(&body)?;
    debug!("Payment webhook for {}: {:?}", event.link_id, event.status);
    let applied = state
        .engine
        .reservations
        .process_payment_outcome(&event.link_id, event.status)
        .await
        .map_err(TutorbookError::from);
    let applied = log_result(applied, "Payment webhook applied", "Processing payment webhook")?;
    Ok(Json(applied))
}

pub async fn get_payment_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Path(payment_id): Path<PaymentId>,
) -> Result<Json<Payment>, TutorbookError> {
    Ok(Json(state.engine.reservations.payment(&auth, payment_id).await?))
}

// --- Plans ---

pub async fn list_plans_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Query(query): Query<PlanListQuery>,
) -> Result<Json<Vec<BookingPlan>>, TutorbookError> {
    let tutor_id = query.tutor_id.unwrap_or(auth.user_id);
    Ok(Json(state.engine.plans.list_plans(&tutor_id).await?))
}

pub async fn create_plan_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Json(draft): Json<PlanDraft>,
) -> Result<Json<BookingPlan>, TutorbookError> {
    Ok(Json(state.engine.plans.create_plan(&auth, draft).await?))
}

pub async fn update_plan_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Path(plan_id): Path<PlanId>,
    Json(draft): Json<PlanDraft>,
) -> Result<Json<PlanChange>, TutorbookError> {
    Ok(Json(state.engine.plans.update_plan(&auth, plan_id, draft).await?))
}

pub async fn delete_plan_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Path(plan_id): Path<PlanId>,
) -> Result<Json<PlanChange>, TutorbookError> {
    Ok(Json(state.engine.plans.delete_plan(&auth, plan_id).await?))
}

pub async fn plan_slots_handler(
    State(state): State<BookingState>,
    _auth: AuthContext,
    Path(plan_id): Path<PlanId>,
) -> Result<Json<Vec<Slot>>, TutorbookError> {
    Ok(Json(state.engine.plans.plan_slots(plan_id).await?))
}

pub async fn generate_slots_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Path(plan_id): Path<PlanId>,
    Json(request): Json<GenerateSlotsRequest>,
) -> Result<Json<Vec<Slot>>, TutorbookError> {
    let slots = state
        .engine
        .plans
        .generate_slots(&auth, plan_id, request.from, request.weeks)
        .await?;
    Ok(Json(slots))
}

// --- Wallet ---

pub async fn wallet_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
) -> Result<Json<Wallet>, TutorbookError> {
    Ok(Json(state.engine.settlement.wallet(&auth.user_id).await?))
}

// --- Admin ---

pub async fn list_refunds_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Query(query): Query<RefundListQuery>,
) -> Result<Json<Vec<RefundRequest>>, TutorbookError> {
    Ok(Json(state.engine.refunds.list_refunds(&auth, query.status).await?))
}

pub async fn approve_refund_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Path(refund_id): Path<RefundId>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<RefundRequest>, TutorbookError> {
    let refund = state
        .engine
        .refunds
        .approve(&auth, refund_id, request.admin_note)
        .await?;
    Ok(Json(refund))
}

pub async fn reject_refund_handler(
    State(state): State<BookingState>,
    auth: AuthContext,
    Path(refund_id): Path<RefundId>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<RefundRequest>, TutorbookError> {
    let refund = state
        .engine
        .refunds
        .reject(&auth, refund_id, request.admin_note)
        .await?;
    Ok(Json(refund))
}

pub async fn health_handler(State(state): State<BookingState>) -> Json<HealthResponse> {
    let store = state.engine.deps.store.is_healthy().await;
    Json(HealthResponse {
        status: if store { "ok" } else { "degraded" },
        store,
    })
}
