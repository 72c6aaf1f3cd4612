//! In-memory store
//!
//! Committed rows live in one table set guarded by a reader/writer lock that doubles as the
//! commit gate: a commit applies all of its staged rows under the write half, so readers see
//! either none or all of them. Row locks are separate async mutexes keyed by [`LockKey`] and
//! are held until the transaction commits or is dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};
use tutorbook_common::models::{
    BookingPlan, PackageId, PackagePurchase, Payment, PaymentId, PaymentStatus, PaymentType,
    PlanId, RefundId, RefundRequest, RefundStatus, Slot, SlotId, SlotStatus, Wallet, Withdrawal,
    WithdrawalId, WithdrawalStatus,
};

use crate::error::DbError;
use crate::store::{lock_order, BookingStore, BookingTx, LockKey, LockSet};

#[derive(Debug, Default)]
struct Tables {
    plans: BTreeMap<PlanId, BookingPlan>,
    slots: BTreeMap<SlotId, Slot>,
    payments: BTreeMap<PaymentId, Payment>,
    packages: BTreeMap<PackageId, PackagePurchase>,
    refunds: BTreeMap<RefundId, RefundRequest>,
    wallets: HashMap<String, Wallet>,
    withdrawals: BTreeMap<WithdrawalId, Withdrawal>,
}

/// Staged writes of one transaction. `None` marks a deletion.
#[derive(Debug, Default)]
struct Changes {
    plans: BTreeMap<PlanId, Option<BookingPlan>>,
    slots: BTreeMap<SlotId, Option<Slot>>,
    payments: BTreeMap<PaymentId, Option<Payment>>,
    packages: BTreeMap<PackageId, Option<PackagePurchase>>,
    refunds: BTreeMap<RefundId, Option<RefundRequest>>,
    wallets: HashMap<String, Wallet>,
    withdrawals: BTreeMap<WithdrawalId, Option<Withdrawal>>,
}

fn apply<T>(committed: &mut BTreeMap<i64, T>, staged: BTreeMap<i64, Option<T>>) {
    for (id, row) in staged {
        match row {
            Some(row) => {
                committed.insert(id, row);
            }
            None => {
                committed.remove(&id);
            }
        }
    }
}

impl Changes {
    fn apply(self, tables: &mut Tables) {
        apply(&mut tables.plans, self.plans);
        apply(&mut tables.slots, self.slots);
        apply(&mut tables.payments, self.payments);
        apply(&mut tables.packages, self.packages);
        apply(&mut tables.refunds, self.refunds);
        apply(&mut tables.withdrawals, self.withdrawals);
        tables.wallets.extend(self.wallets);
    }
}

/// Committed row overlaid with the transaction's own write, if any.
fn staged_or_committed<T: Clone>(
    committed: &BTreeMap<i64, T>,
    staged: &BTreeMap<i64, Option<T>>,
    id: i64,
) -> Option<T> {
    match staged.get(&id) {
        Some(row) => row.clone(),
        None => committed.get(&id).cloned(),
    }
}

/// All rows matching `keep` as the transaction sees them, ascending by id.
fn merged<T: Clone>(
    committed: &BTreeMap<i64, T>,
    staged: &BTreeMap<i64, Option<T>>,
    keep: impl Fn(&T) -> bool,
) -> Vec<T> {
    let mut rows: BTreeMap<i64, T> = committed
        .iter()
        .filter(|(id, row)| !staged.contains_key(id) && keep(row))
        .map(|(id, row)| (*id, row.clone()))
        .collect();
    for (id, row) in staged {
        if let Some(row) = row {
            if keep(row) {
                rows.insert(*id, row.clone());
            }
        }
    }
    rows.into_values().collect()
}

#[derive(Debug, Default)]
struct Sequences {
    plan: AtomicI64,
    slot: AtomicI64,
    payment: AtomicI64,
    package: AtomicI64,
    refund: AtomicI64,
    withdrawal: AtomicI64,
}

fn next(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<Tables>,
    row_locks: StdMutex<HashMap<LockKey, Arc<Mutex<()>>>>,
    sequences: Sequences,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn row_locks(&self) -> MutexGuard<'_, HashMap<LockKey, Arc<Mutex<()>>>> {
        self.row_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn row_lock(&self, key: &LockKey) -> Arc<Mutex<()>> {
        self.row_locks()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Process-local store used when no database is configured, and by the test suites.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every committed slot, ascending by id.
    pub fn all_slots(&self) -> Vec<Slot> {
        self.inner.read().slots.values().cloned().collect()
    }

    /// Every committed payment, ascending by id.
    pub fn all_payments(&self) -> Vec<Payment> {
        self.inner.read().payments.values().cloned().collect()
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn BookingTx>, DbError> {
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            locks: LockSet::default(),
            guards: Vec::new(),
            changes: Changes::default(),
        }))
    }

    async fn slot(&self, id: SlotId) -> Result<Option<Slot>, DbError> {
        Ok(self.inner.read().slots.get(&id).cloned())
    }

    async fn slots_for_plan(&self, plan_id: PlanId) -> Result<Vec<Slot>, DbError> {
        Ok(self
            .inner
            .read()
            .slots
            .values()
            .filter(|slot| slot.plan_id == plan_id)
            .cloned()
            .collect())
    }

    async fn expired_locked_slots(&self, now: DateTime<Utc>) -> Result<Vec<SlotId>, DbError> {
        Ok(self
            .inner
            .read()
            .slots
            .values()
            .filter(|slot| {
                slot.status == SlotStatus::Locked && slot.expires_at.is_some_and(|exp| exp < now)
            })
            .map(|slot| slot.id)
            .collect())
    }

    async fn plan(&self, id: PlanId) -> Result<Option<BookingPlan>, DbError> {
        Ok(self.inner.read().plans.get(&id).cloned())
    }

    async fn plans_for_tutor(&self, tutor_id: &str) -> Result<Vec<BookingPlan>, DbError> {
        Ok(self
            .inner
            .read()
            .plans
            .values()
            .filter(|plan| plan.tutor_id == tutor_id)
            .cloned()
            .collect())
    }

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, DbError> {
        Ok(self.inner.read().payments.get(&id).cloned())
    }

    async fn payment_by_link(&self, link_id: &str) -> Result<Option<Payment>, DbError> {
        Ok(self
            .inner
            .read()
            .payments
            .values()
            .find(|payment| payment.link_id.as_deref() == Some(link_id))
            .cloned())
    }

    async fn package(&self, id: PackageId) -> Result<Option<PackagePurchase>, DbError> {
        Ok(self.inner.read().packages.get(&id).cloned())
    }

    async fn refund(&self, id: RefundId) -> Result<Option<RefundRequest>, DbError> {
        Ok(self.inner.read().refunds.get(&id).cloned())
    }

    async fn refunds(&self, status: Option<RefundStatus>) -> Result<Vec<RefundRequest>, DbError> {
        Ok(self
            .inner
            .read()
            .refunds
            .values()
            .filter(|refund| status.map_or(true, |s| refund.status == s))
            .cloned()
            .collect())
    }

    async fn wallet(&self, tutor_id: &str) -> Result<Option<Wallet>, DbError> {
        Ok(self.inner.read().wallets.get(tutor_id).cloned())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

pub struct MemoryTx {
    inner: Arc<Inner>,
    locks: LockSet,
    guards: Vec<OwnedMutexGuard<()>>,
    changes: Changes,
}

impl MemoryTx {
    /// Waits for the row lock behind `key`. Re-acquiring a held key is a no-op.
    async fn acquire(&mut self, key: LockKey) {
        if self.locks.contains(&key) {
            return;
        }
        let mutex = self.inner.row_lock(&key);
        trace!("waiting for {:?}", key);
        let guard = mutex.lock_owned().await;
        self.guards.push(guard);
        self.locks.insert(key);
    }

    fn slot_view(&self, id: SlotId) -> Option<Slot> {
        staged_or_committed(&self.inner.read().slots, &self.changes.slots, id)
    }
}

#[async_trait]
impl BookingTx for MemoryTx {
    async fn lock_tutor(&mut self, tutor_id: &str) -> Result<(), DbError> {
        self.acquire(LockKey::Tutor(tutor_id.to_string())).await;
        Ok(())
    }

    async fn lock_plan(&mut self, id: PlanId) -> Result<Option<BookingPlan>, DbError> {
        self.acquire(LockKey::Plan(id)).await;
        Ok(staged_or_committed(&self.inner.read().plans, &self.changes.plans, id))
    }

    async fn lock_package(&mut self, id: PackageId) -> Result<Option<PackagePurchase>, DbError> {
        self.acquire(LockKey::Package(id)).await;
        Ok(staged_or_committed(&self.inner.read().packages, &self.changes.packages, id))
    }

    async fn lock_slots(&mut self, ids: &[SlotId]) -> Result<Vec<Slot>, DbError> {
        let ordered = lock_order(ids);
        for id in &ordered {
            self.acquire(LockKey::Slot(*id)).await;
        }
        Ok(ordered.into_iter().filter_map(|id| self.slot_view(id)).collect())
    }

    async fn lock_payment(&mut self, id: PaymentId) -> Result<Option<Payment>, DbError> {
        self.acquire(LockKey::Payment(id)).await;
        Ok(staged_or_committed(&self.inner.read().payments, &self.changes.payments, id))
    }

    async fn lock_refund(&mut self, id: RefundId) -> Result<Option<RefundRequest>, DbError> {
        self.acquire(LockKey::Refund(id)).await;
        Ok(staged_or_committed(&self.inner.read().refunds, &self.changes.refunds, id))
    }

    async fn lock_wallet(&mut self, tutor_id: &str) -> Result<Wallet, DbError> {
        self.acquire(LockKey::Wallet(tutor_id.to_string())).await;
        if let Some(wallet) = self.changes.wallets.get(tutor_id) {
            return Ok(wallet.clone());
        }
        Ok(self
            .inner
            .read()
            .wallets
            .get(tutor_id)
            .cloned()
            .unwrap_or_else(|| Wallet::empty(tutor_id)))
    }

    async fn plan(&mut self, id: PlanId) -> Result<Option<BookingPlan>, DbError> {
        Ok(staged_or_committed(&self.inner.read().plans, &self.changes.plans, id))
    }

    async fn plans_for_tutor(&mut self, tutor_id: &str) -> Result<Vec<BookingPlan>, DbError> {
        Ok(merged(&self.inner.read().plans, &self.changes.plans, |plan| {
            plan.tutor_id == tutor_id
        }))
    }

    async fn slots_for_plan(&mut self, plan_id: PlanId) -> Result<Vec<Slot>, DbError> {
        Ok(merged(&self.inner.read().slots, &self.changes.slots, |slot| {
            slot.plan_id == plan_id
        }))
    }

    async fn slots_for_payment(&mut self, payment_id: PaymentId) -> Result<Vec<Slot>, DbError> {
        Ok(merged(&self.inner.read().slots, &self.changes.slots, |slot| {
            slot.payment_id == Some(payment_id)
        }))
    }

    async fn payment(&mut self, id: PaymentId) -> Result<Option<Payment>, DbError> {
        Ok(staged_or_committed(&self.inner.read().payments, &self.changes.payments, id))
    }

    async fn paid_booking_payments(&mut self, tutor_id: &str) -> Result<Vec<Payment>, DbError> {
        Ok(merged(&self.inner.read().payments, &self.changes.payments, |payment| {
            payment.tutor_id == tutor_id
                && payment.payment_type == PaymentType::Booking
                && payment.status == PaymentStatus::Paid
        }))
    }

    async fn approved_withdrawal_total(&mut self, tutor_id: &str) -> Result<Decimal, DbError> {
        Ok(merged(&self.inner.read().withdrawals, &self.changes.withdrawals, |w| {
            w.tutor_id == tutor_id && w.status == WithdrawalStatus::Approved
        })
        .iter()
        .map(|w| w.amount)
        .sum())
    }

    async fn pending_refund_for_slot(
        &mut self,
        slot_id: SlotId,
    ) -> Result<Option<RefundRequest>, DbError> {
        Ok(merged(&self.inner.read().refunds, &self.changes.refunds, |refund| {
            refund.slot_id == slot_id && refund.status == RefundStatus::Pending
        })
        .into_iter()
        .next())
    }

    async fn insert_plan(&mut self, mut plan: BookingPlan) -> Result<BookingPlan, DbError> {
        plan.id = next(&self.inner.sequences.plan);
        self.locks.insert(LockKey::Plan(plan.id));
        self.changes.plans.insert(plan.id, Some(plan.clone()));
        debug!("staged plan {}", plan.id);
        Ok(plan)
    }

    async fn update_plan(&mut self, plan: &BookingPlan) -> Result<(), DbError> {
        self.locks.require(LockKey::Plan(plan.id))?;
        self.changes.plans.insert(plan.id, Some(plan.clone()));
        Ok(())
    }

    async fn delete_plan(&mut self, id: PlanId) -> Result<(), DbError> {
        self.locks.require(LockKey::Plan(id))?;
        let cascade: Vec<SlotId> = merged(&self.inner.read().slots, &self.changes.slots, |slot| {
            slot.plan_id == id
        })
        .into_iter()
        .map(|slot| slot.id)
        .collect();
        for slot_id in &cascade {
            self.locks.require(LockKey::Slot(*slot_id))?;
        }
        for slot_id in cascade {
            self.changes.slots.insert(slot_id, None);
        }
        self.changes.plans.insert(id, None);
        Ok(())
    }

    async fn insert_slot(&mut self, mut slot: Slot) -> Result<Slot, DbError> {
        slot.id = next(&self.inner.sequences.slot);
        self.locks.insert(LockKey::Slot(slot.id));
        self.changes.slots.insert(slot.id, Some(slot.clone()));
        Ok(slot)
    }

    async fn update_slot(&mut self, slot: &Slot) -> Result<(), DbError> {
        self.locks.require(LockKey::Slot(slot.id))?;
        if self.slot_view(slot.id).is_none() {
            return Err(DbError::missing("slot", slot.id));
        }
        self.changes.slots.insert(slot.id, Some(slot.clone()));
        Ok(())
    }

    async fn delete_slot(&mut self, id: SlotId) -> Result<(), DbError> {
        self.locks.require(LockKey::Slot(id))?;
        self.changes.slots.insert(id, None);
        Ok(())
    }

    async fn insert_payment(&mut self, mut payment: Payment) -> Result<Payment, DbError> {
        payment.id = next(&self.inner.sequences.payment);
        self.locks.insert(LockKey::Payment(payment.id));
        self.changes.payments.insert(payment.id, Some(payment.clone()));
        Ok(payment)
    }

    async fn update_payment(&mut self, payment: &Payment) -> Result<(), DbError> {
        self.locks.require(LockKey::Payment(payment.id))?;
        self.changes.payments.insert(payment.id, Some(payment.clone()));
        Ok(())
    }

    async fn insert_package(
        &mut self,
        mut package: PackagePurchase,
    ) -> Result<PackagePurchase, DbError> {
        package.id = next(&self.inner.sequences.package);
        self.locks.insert(LockKey::Package(package.id));
        self.changes.packages.insert(package.id, Some(package.clone()));
        Ok(package)
    }

    async fn update_package(&mut self, package: &PackagePurchase) -> Result<(), DbError> {
        self.locks.require(LockKey::Package(package.id))?;
        self.changes.packages.insert(package.id, Some(package.clone()));
        Ok(())
    }

    async fn insert_refund(&mut self, mut refund: RefundRequest) -> Result<RefundRequest, DbError> {
        refund.id = next(&self.inner.sequences.refund);
        self.locks.insert(LockKey::Refund(refund.id));
        self.changes.refunds.insert(refund.id, Some(refund.clone()));
        Ok(refund)
    }

    async fn update_refund(&mut self, refund: &RefundRequest) -> Result<(), DbError> {
        self.locks.require(LockKey::Refund(refund.id))?;
        self.changes.refunds.insert(refund.id, Some(refund.clone()));
        Ok(())
    }

    async fn save_wallet(&mut self, wallet: &Wallet) -> Result<(), DbError> {
        self.locks.require(LockKey::Wallet(wallet.tutor_id.clone()))?;
        self.changes
            .wallets
            .insert(wallet.tutor_id.clone(), wallet.clone());
        Ok(())
    }

    async fn insert_withdrawal(
        &mut self,
        mut withdrawal: Withdrawal,
    ) -> Result<Withdrawal, DbError> {
        withdrawal.id = next(&self.inner.sequences.withdrawal);
        self.changes
            .withdrawals
            .insert(withdrawal.id, Some(withdrawal.clone()));
        Ok(withdrawal)
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let MemoryTx {
            inner,
            changes,
            guards,
            ..
        } = *self;
        {
            let mut tables = inner.write();
            changes.apply(&mut tables);
        }
        // Row locks are released only once the rows they protect are visible.
        drop(guards);
        Ok(())
    }
}
