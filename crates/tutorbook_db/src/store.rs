//! Store traits for the reservation engine
//!
//! All mutation goes through a [`BookingTx`]. A transaction takes exclusive row locks with the
//! `lock_*` methods, stages writes, and publishes them atomically on [`BookingTx::commit`].
//! Dropping a transaction without committing discards every staged write and releases its locks.
//!
//! Lock acquisition order, which every caller must follow to stay deadlock free:
//! tutor → plan → package → slots (ascending id) → payments → refunds → wallet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tutorbook_common::models::{
    BookingPlan, PackageId, PackagePurchase, Payment, PaymentId, PlanId, RefundId, RefundRequest,
    RefundStatus, Slot, SlotId, Wallet, Withdrawal,
};

use crate::error::DbError;

/// Non-locking reads of committed state plus the entry point for transactions.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn BookingTx>, DbError>;

    async fn slot(&self, id: SlotId) -> Result<Option<Slot>, DbError>;

    async fn slots_for_plan(&self, plan_id: PlanId) -> Result<Vec<Slot>, DbError>;

    /// Ids of Locked slots whose hold ended strictly before `now`, ascending.
    async fn expired_locked_slots(&self, now: DateTime<Utc>) -> Result<Vec<SlotId>, DbError>;

    async fn plan(&self, id: PlanId) -> Result<Option<BookingPlan>, DbError>;

    async fn plans_for_tutor(&self, tutor_id: &str) -> Result<Vec<BookingPlan>, DbError>;

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, DbError>;

    async fn payment_by_link(&self, link_id: &str) -> Result<Option<Payment>, DbError>;

    async fn package(&self, id: PackageId) -> Result<Option<PackagePurchase>, DbError>;

    async fn refund(&self, id: RefundId) -> Result<Option<RefundRequest>, DbError>;

    async fn refunds(&self, status: Option<RefundStatus>) -> Result<Vec<RefundRequest>, DbError>;

    async fn wallet(&self, tutor_id: &str) -> Result<Option<Wallet>, DbError>;

    async fn is_healthy(&self) -> bool;
}

/// One unit of work.
///
/// Reads through a transaction see its own staged writes; everything else they return is
/// committed state and is not locked unless it came from a `lock_*` call.
#[async_trait]
pub trait BookingTx: Send {
    // --- row locks ---

    /// Serializes plan edits of one tutor.
    async fn lock_tutor(&mut self, tutor_id: &str) -> Result<(), DbError>;

    async fn lock_plan(&mut self, id: PlanId) -> Result<Option<BookingPlan>, DbError>;

    async fn lock_package(&mut self, id: PackageId) -> Result<Option<PackagePurchase>, DbError>;

    /// Locks exactly the existing rows among `ids`, in ascending id order, and returns them
    /// in that order. Unknown ids are skipped.
    async fn lock_slots(&mut self, ids: &[SlotId]) -> Result<Vec<Slot>, DbError>;

    async fn lock_payment(&mut self, id: PaymentId) -> Result<Option<Payment>, DbError>;

    async fn lock_refund(&mut self, id: RefundId) -> Result<Option<RefundRequest>, DbError>;

    /// Locks the tutor's wallet, creating an empty one if none exists yet.
    async fn lock_wallet(&mut self, tutor_id: &str) -> Result<Wallet, DbError>;

    // --- reads ---

    async fn plan(&mut self, id: PlanId) -> Result<Option<BookingPlan>, DbError>;

    async fn plans_for_tutor(&mut self, tutor_id: &str) -> Result<Vec<BookingPlan>, DbError>;

    async fn slots_for_plan(&mut self, plan_id: PlanId) -> Result<Vec<Slot>, DbError>;

    async fn slots_for_payment(&mut self, payment_id: PaymentId) -> Result<Vec<Slot>, DbError>;

    async fn payment(&mut self, id: PaymentId) -> Result<Option<Payment>, DbError>;

    /// Paid booking payments of the tutor, the settlement candidates.
    async fn paid_booking_payments(&mut self, tutor_id: &str) -> Result<Vec<Payment>, DbError>;

    async fn approved_withdrawal_total(&mut self, tutor_id: &str) -> Result<Decimal, DbError>;

    async fn pending_refund_for_slot(
        &mut self,
        slot_id: SlotId,
    ) -> Result<Option<RefundRequest>, DbError>;

    // --- writes ---
    // Inserts assign the id and count as locked for the rest of the transaction.

    async fn insert_plan(&mut self, plan: BookingPlan) -> Result<BookingPlan, DbError>;

    async fn update_plan(&mut self, plan: &BookingPlan) -> Result<(), DbError>;

    /// Deletes the plan and every slot of it. Requires the plan lock and the lock of each of
    /// its slots.
    async fn delete_plan(&mut self, id: PlanId) -> Result<(), DbError>;

    async fn insert_slot(&mut self, slot: Slot) -> Result<Slot, DbError>;

    async fn update_slot(&mut self, slot: &Slot) -> Result<(), DbError>;

    async fn delete_slot(&mut self, id: SlotId) -> Result<(), DbError>;

    async fn insert_payment(&mut self, payment: Payment) -> Result<Payment, DbError>;

    async fn update_payment(&mut self, payment: &Payment) -> Result<(), DbError>;

    async fn insert_package(
        &mut self,
        package: PackagePurchase,
    ) -> Result<PackagePurchase, DbError>;

    async fn update_package(&mut self, package: &PackagePurchase) -> Result<(), DbError>;

    async fn insert_refund(&mut self, refund: RefundRequest) -> Result<RefundRequest, DbError>;

    async fn update_refund(&mut self, refund: &RefundRequest) -> Result<(), DbError>;

    async fn save_wallet(&mut self, wallet: &Wallet) -> Result<(), DbError>;

    async fn insert_withdrawal(&mut self, withdrawal: Withdrawal) -> Result<Withdrawal, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;
}

/// Identity of a lockable row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Tutor(String),
    Plan(PlanId),
    Package(PackageId),
    Slot(SlotId),
    Payment(PaymentId),
    Refund(RefundId),
    Wallet(String),
}

impl LockKey {
    pub fn entity(&self) -> &'static str {
        match self {
            LockKey::Tutor(_) => "tutor",
            LockKey::Plan(_) => "plan",
            LockKey::Package(_) => "package",
            LockKey::Slot(_) => "slot",
            LockKey::Payment(_) => "payment",
            LockKey::Refund(_) => "refund",
            LockKey::Wallet(_) => "wallet",
        }
    }

    fn id(&self) -> String {
        match self {
            LockKey::Tutor(id) | LockKey::Wallet(id) => id.clone(),
            LockKey::Plan(id)
            | LockKey::Package(id)
            | LockKey::Slot(id)
            | LockKey::Payment(id)
            | LockKey::Refund(id) => id.to_string(),
        }
    }
}

/// Keys a transaction holds; both backends refuse writes to rows outside this set.
#[derive(Debug, Default)]
pub struct LockSet {
    held: HashSet<LockKey>,
}

impl LockSet {
    pub fn contains(&self, key: &LockKey) -> bool {
        self.held.contains(key)
    }

    pub fn insert(&mut self, key: LockKey) -> bool {
        self.held.insert(key)
    }

    pub fn require(&self, key: LockKey) -> Result<(), DbError> {
        if self.held.contains(&key) {
            Ok(())
        } else {
            Err(DbError::not_locked(key.entity(), key.id()))
        }
    }
}

/// Sorted, duplicate-free copy of `ids`: the order slot locks are taken in.
pub fn lock_order(ids: &[SlotId]) -> Vec<SlotId> {
    let mut ordered = ids.to_vec();
    ordered.sort_unstable();
    ordered.dedup();
    ordered
}
