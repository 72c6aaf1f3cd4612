//! Shared harness for the unit tests of this crate.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc, Weekday};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tutorbook_common::models::{BookingPlan, PackagePurchase, Slot, SlotId};
use tutorbook_common::services::mock::{
    MockIdentityDirectory, MockPaymentGateway, RecordingNotifier, RecordingPayoutLedger,
};
use tutorbook_db::{BookingStore, MemoryStore};

use crate::clock::ManualClock;
use crate::engine::{BookingDeps, BookingEngine, BookingSettings};

pub const TUTOR: &str = "tutor-1";
pub const LEARNER: &str = "learner-1";
pub const OTHER_LEARNER: &str = "learner-2";
pub const ADMIN: &str = "admin-1";

/// Monday 2025-03-03 08:00 UTC.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap()
}

/// Monday a week after [`start`], 09:00 UTC.
pub fn next_monday_nine() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
}

pub fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
}

pub struct Harness {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<MockPaymentGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub directory: Arc<MockIdentityDirectory>,
    pub ledger: Arc<RecordingPayoutLedger>,
    pub engine: BookingEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(BookingSettings::default())
    }

    pub fn with_settings(settings: BookingSettings) -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(start()));
        let gateway = Arc::new(MockPaymentGateway::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let directory = Arc::new(MockIdentityDirectory::new());
        let ledger = Arc::new(RecordingPayoutLedger::new());
        directory.add_admin(ADMIN);

        let deps = BookingDeps {
            store: Arc::new(store.clone()),
            clock: clock.clone(),
            gateway: gateway.clone(),
            notifier: notifier.clone(),
            directory: directory.clone(),
            ledger: ledger.clone(),
            settings: Arc::new(settings),
        };
        Self {
            store,
            clock,
            gateway,
            notifier,
            directory,
            ledger,
            engine: BookingEngine::new(deps),
        }
    }

    /// A Monday 09:00-17:00 plan of [`TUTOR`].
    pub async fn plan(&self, hourly_price: Decimal) -> BookingPlan {
        let mut tx = self.store.begin().await.unwrap();
        let plan = tx
            .insert_plan(BookingPlan {
                id: 0,
                tutor_id: TUTOR.to_string(),
                weekday: Weekday::Mon,
                start_time: hm(9, 0),
                end_time: hm(17, 0),
                slot_minutes: 60,
                hourly_price,
                meeting_link: "https://meet.example.test/tutor-1".to_string(),
                active: true,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        plan
    }

    /// `count` consecutive slots of `minutes` from next Monday 09:00.
    pub async fn slots(&self, plan: &BookingPlan, count: i64, minutes: i64) -> Vec<SlotId> {
        let mut tx = self.store.begin().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..count {
            let start = next_monday_nine() + Duration::minutes(i * minutes);
            let slot = tx
                .insert_slot(Slot::available(
                    plan.id,
                    &plan.tutor_id,
                    start,
                    start + Duration::minutes(minutes),
                ))
                .await
                .unwrap();
            ids.push(slot.id);
        }
        tx.commit().await.unwrap();
        ids
    }

    /// A plan at 40.00/h with `count` one-hour slots.
    pub async fn plan_with_slots(&self, count: i64) -> (BookingPlan, Vec<SlotId>) {
        let plan = self.plan(dec!(40.00)).await;
        let ids = self.slots(&plan, count, 60).await;
        (plan, ids)
    }

    pub async fn package(&self, learner: &str, remaining: i32) -> PackagePurchase {
        let mut tx = self.store.begin().await.unwrap();
        let package = tx
            .insert_package(PackagePurchase {
                id: 0,
                learner_id: learner.to_string(),
                tutor_id: TUTOR.to_string(),
                package_template_id: 1,
                payment_id: None,
                remaining,
                active: true,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        package
    }

    pub async fn slot(&self, id: SlotId) -> Slot {
        self.store.slot(id).await.unwrap().unwrap()
    }

    pub fn assert_invariants(&self) {
        for slot in self.store.all_slots() {
            slot.check_invariants().unwrap();
        }
    }
}
