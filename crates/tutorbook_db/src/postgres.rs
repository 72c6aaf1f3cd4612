//! PostgreSQL implementation of the store
//!
//! Row locks are `SELECT … FOR UPDATE` inside one database transaction; the tutor lock used for
//! plan edits is a transaction-scoped advisory lock. Rows are mapped by hand from `PgRow`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, error, info};
use tutorbook_common::models::{
    BankDetails, BookingPlan, PackageId, PackagePurchase, Payment, PaymentId, PlanId, RefundId,
    RefundRequest, RefundStatus, Slot, SlotId, Wallet, Withdrawal,
};

use crate::client::{DbClient, DbTransaction};
use crate::error::DbError;
use crate::store::{lock_order, BookingStore, BookingTx, LockKey, LockSet};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS booking_plans (
        id BIGSERIAL PRIMARY KEY,
        tutor_id TEXT NOT NULL,
        weekday TEXT NOT NULL,
        start_time TIME NOT NULL,
        end_time TIME NOT NULL,
        slot_minutes BIGINT NOT NULL,
        hourly_price NUMERIC(14, 2) NOT NULL,
        meeting_link TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS payments (
        id BIGSERIAL PRIMARY KEY,
        tutor_id TEXT NOT NULL,
        learner_id TEXT NOT NULL,
        amount NUMERIC(14, 2) NOT NULL,
        payment_type TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        paid_at TIMESTAMPTZ,
        link_id TEXT,
        checkout_url TEXT,
        qr_url TEXT,
        commission_rate NUMERIC(6, 4),
        commission_amount NUMERIC(14, 2),
        net_amount NUMERIC(14, 2)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS payments_link_idx ON payments (link_id)",
    r#"
    CREATE TABLE IF NOT EXISTS package_purchases (
        id BIGSERIAL PRIMARY KEY,
        learner_id TEXT NOT NULL,
        tutor_id TEXT NOT NULL,
        package_template_id BIGINT NOT NULL,
        payment_id BIGINT,
        remaining INTEGER NOT NULL CHECK (remaining >= 0),
        active BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS slots (
        id BIGSERIAL PRIMARY KEY,
        plan_id BIGINT NOT NULL REFERENCES booking_plans (id) ON DELETE CASCADE,
        tutor_id TEXT NOT NULL,
        learner_id TEXT,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        locked_at TIMESTAMPTZ,
        expires_at TIMESTAMPTZ,
        payment_id BIGINT,
        package_id BIGINT,
        tutor_joined BOOLEAN NOT NULL DEFAULT FALSE,
        tutor_evidence_url TEXT,
        learner_joined BOOLEAN NOT NULL DEFAULT FALSE,
        learner_evidence_url TEXT,
        UNIQUE (plan_id, start_time)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS slots_hold_idx ON slots (status, expires_at)",
    "CREATE INDEX IF NOT EXISTS slots_payment_idx ON slots (payment_id)",
    r#"
    CREATE TABLE IF NOT EXISTS refund_requests (
        id BIGSERIAL PRIMARY KEY,
        slot_id BIGINT NOT NULL,
        plan_id BIGINT NOT NULL,
        learner_id TEXT NOT NULL,
        tutor_id TEXT NOT NULL,
        package_id BIGINT,
        payment_id BIGINT,
        amount NUMERIC(14, 2) NOT NULL,
        reason TEXT NOT NULL,
        note TEXT,
        evidence_url TEXT,
        bank_name TEXT,
        account_number TEXT,
        account_holder TEXT,
        status TEXT NOT NULL,
        admin_note TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        decided_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS refund_requests_one_pending
        ON refund_requests (slot_id) WHERE status = 'pending'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallets (
        tutor_id TEXT PRIMARY KEY,
        balance NUMERIC(14, 2) NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS withdrawals (
        id BIGSERIAL PRIMARY KEY,
        tutor_id TEXT NOT NULL,
        amount NUMERIC(14, 2) NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

const PLAN_COLUMNS: &str =
    "id, tutor_id, weekday, start_time, end_time, slot_minutes, hourly_price, meeting_link, active";
const SLOT_COLUMNS: &str = "id, plan_id, tutor_id, learner_id, start_time, end_time, status, \
     locked_at, expires_at, payment_id, package_id, tutor_joined, tutor_evidence_url, \
     learner_joined, learner_evidence_url";
const PAYMENT_COLUMNS: &str = "id, tutor_id, learner_id, amount, payment_type, status, \
     created_at, expires_at, paid_at, link_id, checkout_url, qr_url, commission_rate, \
     commission_amount, net_amount";
const PACKAGE_COLUMNS: &str =
    "id, learner_id, tutor_id, package_template_id, payment_id, remaining, active";
const REFUND_COLUMNS: &str = "id, slot_id, plan_id, learner_id, tutor_id, package_id, \
     payment_id, amount, reason, note, evidence_url, bank_name, account_number, account_holder, \
     status, admin_note, created_at, decided_at";

fn decode_label<T>(entity: &'static str, row: &PgRow, column: &str) -> Result<T, DbError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|e| DbError::DecodeError {
        entity,
        message: e.to_string(),
    })
}

fn plan_from_row(row: &PgRow) -> Result<BookingPlan, DbError> {
    let weekday: String = row.try_get("weekday")?;
    let weekday = weekday.parse::<Weekday>().map_err(|_| DbError::DecodeError {
        entity: "plan",
        message: format!("unknown weekday {}", weekday),
    })?;
    Ok(BookingPlan {
        id: row.try_get("id")?,
        tutor_id: row.try_get("tutor_id")?,
        weekday,
        start_time: row.try_get::<NaiveTime, _>("start_time")?,
        end_time: row.try_get::<NaiveTime, _>("end_time")?,
        slot_minutes: row.try_get("slot_minutes")?,
        hourly_price: row.try_get("hourly_price")?,
        meeting_link: row.try_get("meeting_link")?,
        active: row.try_get("active")?,
    })
}

fn slot_from_row(row: &PgRow) -> Result<Slot, DbError> {
    Ok(Slot {
        id: row.try_get("id")?,
        plan_id: row.try_get("plan_id")?,
        tutor_id: row.try_get("tutor_id")?,
        learner_id: row.try_get("learner_id")?,
        start_time: row.try_get::<DateTime<Utc>, _>("start_time")?,
        end_time: row.try_get::<DateTime<Utc>, _>("end_time")?,
        status: decode_label("slot", row, "status")?,
        locked_at: row.try_get("locked_at")?,
        expires_at: row.try_get("expires_at")?,
        payment_id: row.try_get("payment_id")?,
        package_id: row.try_get("package_id")?,
        tutor_joined: row.try_get("tutor_joined")?,
        tutor_evidence_url: row.try_get("tutor_evidence_url")?,
        learner_joined: row.try_get("learner_joined")?,
        learner_evidence_url: row.try_get("learner_evidence_url")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, DbError> {
    Ok(Payment {
        id: row.try_get("id")?,
        tutor_id: row.try_get("tutor_id")?,
        learner_id: row.try_get("learner_id")?,
        amount: row.try_get("amount")?,
        payment_type: decode_label("payment", row, "payment_type")?,
        status: decode_label("payment", row, "status")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        paid_at: row.try_get("paid_at")?,
        link_id: row.try_get("link_id")?,
        checkout_url: row.try_get("checkout_url")?,
        qr_url: row.try_get("qr_url")?,
        commission_rate: row.try_get("commission_rate")?,
        commission_amount: row.try_get("commission_amount")?,
        net_amount: row.try_get("net_amount")?,
    })
}

fn package_from_row(row: &PgRow) -> Result<PackagePurchase, DbError> {
    Ok(PackagePurchase {
        id: row.try_get("id")?,
        learner_id: row.try_get("learner_id")?,
        tutor_id: row.try_get("tutor_id")?,
        package_template_id: row.try_get("package_template_id")?,
        payment_id: row.try_get("payment_id")?,
        remaining: row.try_get("remaining")?,
        active: row.try_get("active")?,
    })
}

fn refund_from_row(row: &PgRow) -> Result<RefundRequest, DbError> {
    Ok(RefundRequest {
        id: row.try_get("id")?,
        slot_id: row.try_get("slot_id")?,
        plan_id: row.try_get("plan_id")?,
        learner_id: row.try_get("learner_id")?,
        tutor_id: row.try_get("tutor_id")?,
        package_id: row.try_get("package_id")?,
        payment_id: row.try_get("payment_id")?,
        amount: row.try_get("amount")?,
        reason: decode_label("refund", row, "reason")?,
        note: row.try_get("note")?,
        evidence_url: row.try_get("evidence_url")?,
        bank: BankDetails {
            bank_name: row.try_get("bank_name")?,
            account_number: row.try_get("account_number")?,
            account_holder: row.try_get("account_holder")?,
        },
        status: decode_label("refund", row, "status")?,
        admin_note: row.try_get("admin_note")?,
        created_at: row.try_get("created_at")?,
        decided_at: row.try_get("decided_at")?,
    })
}

fn wallet_from_row(row: &PgRow) -> Result<Wallet, DbError> {
    Ok(Wallet {
        tutor_id: row.try_get("tutor_id")?,
        balance: row.try_get("balance")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn collect<T>(rows: Vec<PgRow>, map: fn(&PgRow) -> Result<T, DbError>) -> Result<Vec<T>, DbError> {
    rows.iter().map(map).collect()
}

fn query_failed(what: &str) -> impl Fn(sqlx::Error) -> DbError + '_ {
    move |e| {
        error!("Failed to {}: {}", what, e);
        DbError::QueryError(e.to_string())
    }
}

/// Store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgBookingStore {
    db_client: DbClient,
}

impl PgBookingStore {
    pub fn new(db_client: DbClient) -> Self {
        Self { db_client }
    }

    /// Creates the tables and indexes if they don't exist yet.
    pub async fn init_schema(&self) -> Result<(), DbError> {
        debug!("Initializing booking schema");
        for statement in SCHEMA {
            self.db_client.execute(statement).await?;
        }
        info!("Booking schema initialized successfully");
        Ok(())
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn begin(&self) -> Result<Box<dyn BookingTx>, DbError> {
        let tx = self.db_client.begin().await?;
        Ok(Box::new(PgTx {
            tx,
            locks: LockSet::default(),
        }))
    }

    async fn slot(&self, id: SlotId) -> Result<Option<Slot>, DbError> {
        let sql = format!("SELECT {SLOT_COLUMNS} FROM slots WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db_client.pool())
            .await
            .map_err(query_failed("load slot"))?
            .map(|row| slot_from_row(&row))
            .transpose()
    }

    async fn slots_for_plan(&self, plan_id: PlanId) -> Result<Vec<Slot>, DbError> {
        let sql = format!("SELECT {SLOT_COLUMNS} FROM slots WHERE plan_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(plan_id)
            .fetch_all(self.db_client.pool())
            .await
            .map_err(query_failed("load plan slots"))?;
        collect(rows, slot_from_row)
    }

    async fn expired_locked_slots(&self, now: DateTime<Utc>) -> Result<Vec<SlotId>, DbError> {
        let rows = sqlx::query(
            "SELECT id FROM slots WHERE status = 'locked' AND expires_at < $1 ORDER BY id",
        )
        .bind(now)
        .fetch_all(self.db_client.pool())
        .await
        .map_err(query_failed("scan expired holds"))?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(DbError::from))
            .collect()
    }

    async fn plan(&self, id: PlanId) -> Result<Option<BookingPlan>, DbError> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM booking_plans WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db_client.pool())
            .await
            .map_err(query_failed("load plan"))?
            .map(|row| plan_from_row(&row))
            .transpose()
    }

    async fn plans_for_tutor(&self, tutor_id: &str) -> Result<Vec<BookingPlan>, DbError> {
        let sql =
            format!("SELECT {PLAN_COLUMNS} FROM booking_plans WHERE tutor_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(tutor_id)
            .fetch_all(self.db_client.pool())
            .await
            .map_err(query_failed("load tutor plans"))?;
        collect(rows, plan_from_row)
    }

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, DbError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db_client.pool())
            .await
            .map_err(query_failed("load payment"))?
            .map(|row| payment_from_row(&row))
            .transpose()
    }

    async fn payment_by_link(&self, link_id: &str) -> Result<Option<Payment>, DbError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE link_id = $1");
        sqlx::query(&sql)
            .bind(link_id)
            .fetch_optional(self.db_client.pool())
            .await
            .map_err(query_failed("load payment by link"))?
            .map(|row| payment_from_row(&row))
            .transpose()
    }

    async fn package(&self, id: PackageId) -> Result<Option<PackagePurchase>, DbError> {
        let sql = format!("SELECT {PACKAGE_COLUMNS} FROM package_purchases WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db_client.pool())
            .await
            .map_err(query_failed("load package"))?
            .map(|row| package_from_row(&row))
            .transpose()
    }

    async fn refund(&self, id: RefundId) -> Result<Option<RefundRequest>, DbError> {
        let sql = format!("SELECT {REFUND_COLUMNS} FROM refund_requests WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db_client.pool())
            .await
            .map_err(query_failed("load refund"))?
            .map(|row| refund_from_row(&row))
            .transpose()
    }

    async fn refunds(&self, status: Option<RefundStatus>) -> Result<Vec<RefundRequest>, DbError> {
        let sql = format!(
            "SELECT {REFUND_COLUMNS} FROM refund_requests \
             WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(self.db_client.pool())
            .await
            .map_err(query_failed("list refunds"))?;
        collect(rows, refund_from_row)
    }

    async fn wallet(&self, tutor_id: &str) -> Result<Option<Wallet>, DbError> {
        sqlx::query("SELECT tutor_id, balance, updated_at FROM wallets WHERE tutor_id = $1")
            .bind(tutor_id)
            .fetch_optional(self.db_client.pool())
            .await
            .map_err(query_failed("load wallet"))?
            .map(|row| wallet_from_row(&row))
            .transpose()
    }

    async fn is_healthy(&self) -> bool {
        self.db_client.is_healthy().await
    }
}

pub struct PgTx {
    tx: DbTransaction,
    locks: LockSet,
}

impl PgTx {
    async fn execute_one(
        &mut self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        entity: &'static str,
        id: String,
    ) -> Result<(), DbError> {
        let result = query
            .execute(&mut *self.tx)
            .await
            .map_err(query_failed("write row"))?;
        if result.rows_affected() == 0 {
            return Err(DbError::missing(entity, id));
        }
        Ok(())
    }
}

#[async_trait]
impl BookingTx for PgTx {
    async fn lock_tutor(&mut self, tutor_id: &str) -> Result<(), DbError> {
        let key = LockKey::Tutor(tutor_id.to_string());
        if self.locks.contains(&key) {
            return Ok(());
        }
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(tutor_id)
            .execute(&mut *self.tx)
            .await
            .map_err(query_failed("take tutor lock"))?;
        self.locks.insert(key);
        Ok(())
    }

    async fn lock_plan(&mut self, id: PlanId) -> Result<Option<BookingPlan>, DbError> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM booking_plans WHERE id = $1 FOR UPDATE");
        let plan = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_failed("lock plan"))?
            .map(|row| plan_from_row(&row))
            .transpose()?;
        self.locks.insert(LockKey::Plan(id));
        Ok(plan)
    }

    async fn lock_package(&mut self, id: PackageId) -> Result<Option<PackagePurchase>, DbError> {
        let sql =
            format!("SELECT {PACKAGE_COLUMNS} FROM package_purchases WHERE id = $1 FOR UPDATE");
        let package = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_failed("lock package"))?
            .map(|row| package_from_row(&row))
            .transpose()?;
        self.locks.insert(LockKey::Package(id));
        Ok(package)
    }

    async fn lock_slots(&mut self, ids: &[SlotId]) -> Result<Vec<Slot>, DbError> {
        let ordered = lock_order(ids);
        let sql = format!(
            "SELECT {SLOT_COLUMNS} FROM slots WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(&ordered)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(query_failed("lock slots"))?;
        let slots = collect(rows, slot_from_row)?;
        for slot in &slots {
            self.locks.insert(LockKey::Slot(slot.id));
        }
        Ok(slots)
    }

    async fn lock_payment(&mut self, id: PaymentId) -> Result<Option<Payment>, DbError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE");
        let payment = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_failed("lock payment"))?
            .map(|row| payment_from_row(&row))
            .transpose()?;
        self.locks.insert(LockKey::Payment(id));
        Ok(payment)
    }

    async fn lock_refund(&mut self, id: RefundId) -> Result<Option<RefundRequest>, DbError> {
        let sql = format!("SELECT {REFUND_COLUMNS} FROM refund_requests WHERE id = $1 FOR UPDATE");
        let refund = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_failed("lock refund"))?
            .map(|row| refund_from_row(&row))
            .transpose()?;
        self.locks.insert(LockKey::Refund(id));
        Ok(refund)
    }

    async fn lock_wallet(&mut self, tutor_id: &str) -> Result<Wallet, DbError> {
        sqlx::query(
            "INSERT INTO wallets (tutor_id, balance) VALUES ($1, 0) \
             ON CONFLICT (tutor_id) DO NOTHING",
        )
        .bind(tutor_id)
        .execute(&mut *self.tx)
        .await
        .map_err(query_failed("create wallet"))?;
        let row = sqlx::query(
            "SELECT tutor_id, balance, updated_at FROM wallets WHERE tutor_id = $1 FOR UPDATE",
        )
        .bind(tutor_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("lock wallet"))?;
        self.locks.insert(LockKey::Wallet(tutor_id.to_string()));
        wallet_from_row(&row)
    }

    async fn plan(&mut self, id: PlanId) -> Result<Option<BookingPlan>, DbError> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM booking_plans WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_failed("load plan"))?
            .map(|row| plan_from_row(&row))
            .transpose()
    }

    async fn plans_for_tutor(&mut self, tutor_id: &str) -> Result<Vec<BookingPlan>, DbError> {
        let sql =
            format!("SELECT {PLAN_COLUMNS} FROM booking_plans WHERE tutor_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(tutor_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(query_failed("load tutor plans"))?;
        collect(rows, plan_from_row)
    }

    async fn slots_for_plan(&mut self, plan_id: PlanId) -> Result<Vec<Slot>, DbError> {
        let sql = format!("SELECT {SLOT_COLUMNS} FROM slots WHERE plan_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(plan_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(query_failed("load plan slots"))?;
        collect(rows, slot_from_row)
    }

    async fn slots_for_payment(&mut self, payment_id: PaymentId) -> Result<Vec<Slot>, DbError> {
        let sql = format!("SELECT {SLOT_COLUMNS} FROM slots WHERE payment_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(payment_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(query_failed("load payment slots"))?;
        collect(rows, slot_from_row)
    }

    async fn payment(&mut self, id: PaymentId) -> Result<Option<Payment>, DbError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_failed("load payment"))?
            .map(|row| payment_from_row(&row))
            .transpose()
    }

    async fn paid_booking_payments(&mut self, tutor_id: &str) -> Result<Vec<Payment>, DbError> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE tutor_id = $1 AND payment_type = 'booking' AND status = 'paid' ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(tutor_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(query_failed("load paid bookings"))?;
        collect(rows, payment_from_row)
    }

    async fn approved_withdrawal_total(&mut self, tutor_id: &str) -> Result<Decimal, DbError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount), 0) AS total FROM withdrawals \
             WHERE tutor_id = $1 AND status = 'approved'",
        )
        .bind(tutor_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("sum withdrawals"))?;
        Ok(row.try_get("total")?)
    }

    async fn pending_refund_for_slot(
        &mut self,
        slot_id: SlotId,
    ) -> Result<Option<RefundRequest>, DbError> {
        let sql = format!(
            "SELECT {REFUND_COLUMNS} FROM refund_requests WHERE slot_id = $1 AND status = 'pending'"
        );
        sqlx::query(&sql)
            .bind(slot_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(query_failed("load pending refund"))?
            .map(|row| refund_from_row(&row))
            .transpose()
    }

    async fn insert_plan(&mut self, mut plan: BookingPlan) -> Result<BookingPlan, DbError> {
        let row = sqlx::query(
            "INSERT INTO booking_plans \
             (tutor_id, weekday, start_time, end_time, slot_minutes, hourly_price, \
              meeting_link, active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
        )
        .bind(&plan.tutor_id)
        .bind(plan.weekday.to_string())
        .bind(plan.start_time)
        .bind(plan.end_time)
        .bind(plan.slot_minutes)
        .bind(plan.hourly_price)
        .bind(&plan.meeting_link)
        .bind(plan.active)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("insert plan"))?;
        plan.id = row.try_get("id")?;
        self.locks.insert(LockKey::Plan(plan.id));
        Ok(plan)
    }

    async fn update_plan(&mut self, plan: &BookingPlan) -> Result<(), DbError> {
        self.locks.require(LockKey::Plan(plan.id))?;
        let query = sqlx::query(
            "UPDATE booking_plans SET weekday = $2, start_time = $3, end_time = $4, \
             slot_minutes = $5, hourly_price = $6, meeting_link = $7, active = $8 WHERE id = $1",
        )
        .bind(plan.id)
        .bind(plan.weekday.to_string())
        .bind(plan.start_time)
        .bind(plan.end_time)
        .bind(plan.slot_minutes)
        .bind(plan.hourly_price)
        .bind(plan.meeting_link.clone())
        .bind(plan.active);
        self.execute_one(query, "plan", plan.id.to_string()).await
    }

    async fn delete_plan(&mut self, id: PlanId) -> Result<(), DbError> {
        self.locks.require(LockKey::Plan(id))?;
        for slot in self.slots_for_plan(id).await? {
            self.locks.require(LockKey::Slot(slot.id))?;
        }
        sqlx::query("DELETE FROM slots WHERE plan_id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(query_failed("delete plan slots"))?;
        let query = sqlx::query("DELETE FROM booking_plans WHERE id = $1").bind(id);
        self.execute_one(query, "plan", id.to_string()).await
    }

    async fn insert_slot(&mut self, mut slot: Slot) -> Result<Slot, DbError> {
        let row = sqlx::query(
            "INSERT INTO slots (plan_id, tutor_id, learner_id, start_time, end_time, status, \
             locked_at, expires_at, payment_id, package_id, tutor_joined, tutor_evidence_url, \
             learner_joined, learner_evidence_url) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) RETURNING id",
        )
        .bind(slot.plan_id)
        .bind(&slot.tutor_id)
        .bind(&slot.learner_id)
        .bind(slot.start_time)
        .bind(slot.end_time)
        .bind(slot.status.as_str())
        .bind(slot.locked_at)
        .bind(slot.expires_at)
        .bind(slot.payment_id)
        .bind(slot.package_id)
        .bind(slot.tutor_joined)
        .bind(&slot.tutor_evidence_url)
        .bind(slot.learner_joined)
        .bind(&slot.learner_evidence_url)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("insert slot"))?;
        slot.id = row.try_get("id")?;
        self.locks.insert(LockKey::Slot(slot.id));
        Ok(slot)
    }

    async fn update_slot(&mut self, slot: &Slot) -> Result<(), DbError> {
        self.locks.require(LockKey::Slot(slot.id))?;
        let query = sqlx::query(
            "UPDATE slots SET learner_id = $2, start_time = $3, end_time = $4, status = $5, \
             locked_at = $6, expires_at = $7, payment_id = $8, package_id = $9, \
             tutor_joined = $10, tutor_evidence_url = $11, learner_joined = $12, \
             learner_evidence_url = $13 WHERE id = $1",
        )
        .bind(slot.id)
        .bind(slot.learner_id.clone())
        .bind(slot.start_time)
        .bind(slot.end_time)
        .bind(slot.status.as_str())
        .bind(slot.locked_at)
        .bind(slot.expires_at)
        .bind(slot.payment_id)
        .bind(slot.package_id)
        .bind(slot.tutor_joined)
        .bind(slot.tutor_evidence_url.clone())
        .bind(slot.learner_joined)
        .bind(slot.learner_evidence_url.clone());
        self.execute_one(query, "slot", slot.id.to_string()).await
    }

    async fn delete_slot(&mut self, id: SlotId) -> Result<(), DbError> {
        self.locks.require(LockKey::Slot(id))?;
        let query = sqlx::query("DELETE FROM slots WHERE id = $1").bind(id);
        self.execute_one(query, "slot", id.to_string()).await
    }

    async fn insert_payment(&mut self, mut payment: Payment) -> Result<Payment, DbError> {
        let row = sqlx::query(
            "INSERT INTO payments (tutor_id, learner_id, amount, payment_type, status, created_at, \
             expires_at, paid_at, link_id, checkout_url, qr_url, commission_rate, \
             commission_amount, net_amount) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) RETURNING id",
        )
        .bind(&payment.tutor_id)
        .bind(&payment.learner_id)
        .bind(payment.amount)
        .bind(payment.payment_type.as_str())
        .bind(payment.status.as_str())
        .bind(payment.created_at)
        .bind(payment.expires_at)
        .bind(payment.paid_at)
        .bind(&payment.link_id)
        .bind(&payment.checkout_url)
        .bind(&payment.qr_url)
        .bind(payment.commission_rate)
        .bind(payment.commission_amount)
        .bind(payment.net_amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("insert payment"))?;
        payment.id = row.try_get("id")?;
        self.locks.insert(LockKey::Payment(payment.id));
        Ok(payment)
    }

    async fn update_payment(&mut self, payment: &Payment) -> Result<(), DbError> {
        self.locks.require(LockKey::Payment(payment.id))?;
        let query = sqlx::query(
            "UPDATE payments SET amount = $2, status = $3, expires_at = $4, paid_at = $5, \
             link_id = $6, checkout_url = $7, qr_url = $8, commission_rate = $9, \
             commission_amount = $10, net_amount = $11 WHERE id = $1",
        )
        .bind(payment.id)
        .bind(payment.amount)
        .bind(payment.status.as_str())
        .bind(payment.expires_at)
        .bind(payment.paid_at)
        .bind(payment.link_id.clone())
        .bind(payment.checkout_url.clone())
        .bind(payment.qr_url.clone())
        .bind(payment.commission_rate)
        .bind(payment.commission_amount)
        .bind(payment.net_amount);
        self.execute_one(query, "payment", payment.id.to_string()).await
    }

    async fn insert_package(
        &mut self,
        mut package: PackagePurchase,
    ) -> Result<PackagePurchase, DbError> {
        let row = sqlx::query(
            "INSERT INTO package_purchases \
             (learner_id, tutor_id, package_template_id, payment_id, remaining, active) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&package.learner_id)
        .bind(&package.tutor_id)
        .bind(package.package_template_id)
        .bind(package.payment_id)
        .bind(package.remaining)
        .bind(package.active)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("insert package"))?;
        package.id = row.try_get("id")?;
        self.locks.insert(LockKey::Package(package.id));
        Ok(package)
    }

    async fn update_package(&mut self, package: &PackagePurchase) -> Result<(), DbError> {
        self.locks.require(LockKey::Package(package.id))?;
        let query = sqlx::query(
            "UPDATE package_purchases SET remaining = $2, active = $3 WHERE id = $1",
        )
        .bind(package.id)
        .bind(package.remaining)
        .bind(package.active);
        self.execute_one(query, "package", package.id.to_string()).await
    }

    async fn insert_refund(&mut self, mut refund: RefundRequest) -> Result<RefundRequest, DbError> {
        let row = sqlx::query(
            "INSERT INTO refund_requests (slot_id, plan_id, learner_id, tutor_id, package_id, \
             payment_id, amount, reason, note, evidence_url, bank_name, account_number, \
             account_holder, status, admin_note, created_at, decided_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             RETURNING id",
        )
        .bind(refund.slot_id)
        .bind(refund.plan_id)
        .bind(&refund.learner_id)
        .bind(&refund.tutor_id)
        .bind(refund.package_id)
        .bind(refund.payment_id)
        .bind(refund.amount)
        .bind(refund.reason.as_str())
        .bind(&refund.note)
        .bind(&refund.evidence_url)
        .bind(&refund.bank.bank_name)
        .bind(&refund.bank.account_number)
        .bind(&refund.bank.account_holder)
        .bind(refund.status.as_str())
        .bind(&refund.admin_note)
        .bind(refund.created_at)
        .bind(refund.decided_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("insert refund"))?;
        refund.id = row.try_get("id")?;
        self.locks.insert(LockKey::Refund(refund.id));
        Ok(refund)
    }

    async fn update_refund(&mut self, refund: &RefundRequest) -> Result<(), DbError> {
        self.locks.require(LockKey::Refund(refund.id))?;
        let query = sqlx::query(
            "UPDATE refund_requests SET status = $2, admin_note = $3, decided_at = $4 \
             WHERE id = $1",
        )
        .bind(refund.id)
        .bind(refund.status.as_str())
        .bind(refund.admin_note.clone())
        .bind(refund.decided_at);
        self.execute_one(query, "refund", refund.id.to_string()).await
    }

    async fn save_wallet(&mut self, wallet: &Wallet) -> Result<(), DbError> {
        self.locks.require(LockKey::Wallet(wallet.tutor_id.clone()))?;
        let query = sqlx::query(
            "UPDATE wallets SET balance = $2, updated_at = $3 WHERE tutor_id = $1",
        )
        .bind(wallet.tutor_id.clone())
        .bind(wallet.balance)
        .bind(wallet.updated_at);
        self.execute_one(query, "wallet", wallet.tutor_id.clone()).await
    }

    async fn insert_withdrawal(
        &mut self,
        mut withdrawal: Withdrawal,
    ) -> Result<Withdrawal, DbError> {
        let row = sqlx::query(
            "INSERT INTO withdrawals (tutor_id, amount, status, created_at) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(&withdrawal.tutor_id)
        .bind(withdrawal.amount)
        .bind(withdrawal.status.as_str())
        .bind(withdrawal.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(query_failed("insert withdrawal"))?;
        withdrawal.id = row.try_get("id")?;
        Ok(withdrawal)
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx
            .commit()
            .await
            .map_err(|e| DbError::TransactionError(e.to_string()))
    }
}
