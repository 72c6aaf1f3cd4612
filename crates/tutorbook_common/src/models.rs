// --- File: crates/tutorbook_common/src/models.rs ---
//! Records of the slot reservation engine.
//!
//! Every cross-entity reference is an id that is resolved through the store; no record owns
//! another one.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type SlotId = i64;
pub type PlanId = i64;
pub type PaymentId = i64;
pub type PackageId = i64;
pub type RefundId = i64;
pub type WithdrawalId = i64;

/// Error returned when a persisted status label is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status label: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

/// Implements `as_str`/`FromStr`/`Display` for a unit-only status enum.
macro_rules! status_labels {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err(UnknownStatus(other.to_string())),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// --- Slot ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Locked,
    Paid,
    Rejected,
}

status_labels!(SlotStatus {
    Available => "available",
    Locked => "locked",
    Paid => "paid",
    Rejected => "rejected",
});

/// A single bookable one-to-one time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub plan_id: PlanId,
    pub tutor_id: String,
    /// Present only while Locked, Paid or Rejected.
    pub learner_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SlotStatus,
    pub locked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub payment_id: Option<PaymentId>,
    pub package_id: Option<PackageId>,
    pub tutor_joined: bool,
    pub tutor_evidence_url: Option<String>,
    pub learner_joined: bool,
    pub learner_evidence_url: Option<String>,
}

impl Slot {
    /// A fresh, unreserved slot as materialized from a plan.
    pub fn available(
        plan_id: PlanId,
        tutor_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            plan_id,
            tutor_id: tutor_id.to_string(),
            learner_id: None,
            start_time,
            end_time,
            status: SlotStatus::Available,
            locked_at: None,
            expires_at: None,
            payment_id: None,
            package_id: None,
            tutor_joined: false,
            tutor_evidence_url: None,
            learner_joined: false,
            learner_evidence_url: None,
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end_time - self.start_time).num_minutes()
    }

    /// Locked and the hold has run out at `now`.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == SlotStatus::Locked && self.expires_at.map_or(true, |exp| exp <= now)
    }

    pub fn is_mutually_confirmed(&self) -> bool {
        self.tutor_joined && self.learner_joined
    }

    /// Drops every reservation attribute, returning the slot to the pool.
    pub fn reclaim(&mut self) {
        self.status = SlotStatus::Available;
        self.learner_id = None;
        self.locked_at = None;
        self.expires_at = None;
        self.payment_id = None;
        self.package_id = None;
    }

    /// Checks the status/learner/hold invariants of the record.
    pub fn check_invariants(&self) -> Result<(), String> {
        match self.status {
            SlotStatus::Available => {
                if self.learner_id.is_some()
                    || self.locked_at.is_some()
                    || self.expires_at.is_some()
                {
                    return Err(format!("available slot {} still carries a reservation", self.id));
                }
            }
            SlotStatus::Locked => {
                if self.learner_id.is_none() || self.expires_at.is_none() {
                    return Err(format!("locked slot {} has no learner or expiry", self.id));
                }
            }
            SlotStatus::Paid => {
                if self.learner_id.is_none() {
                    return Err(format!("paid slot {} has no learner", self.id));
                }
            }
            SlotStatus::Rejected => {}
        }
        Ok(())
    }
}

// --- BookingPlan ---

/// A tutor's recurring weekly availability template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingPlan {
    pub id: PlanId,
    pub tutor_id: String,
    /// Weekday label; also the grouping key for the weekly-days cap.
    pub weekday: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_minutes: i64,
    pub hourly_price: Decimal,
    pub meeting_link: String,
    pub active: bool,
}

impl BookingPlan {
    pub fn window_overlaps(&self, other_start: NaiveTime, other_end: NaiveTime) -> bool {
        self.start_time < other_end && other_start < self.end_time
    }
}

// --- Payment ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    CoursePurchase,
    Booking,
}

status_labels!(PaymentType {
    CoursePurchase => "course_purchase",
    Booking => "booking",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Expired,
    Cancelled,
}

status_labels!(PaymentStatus {
    Pending => "pending",
    Paid => "paid",
    Expired => "expired",
    Cancelled => "cancelled",
});

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// One checkout; may cover several slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub tutor_id: String,
    pub learner_id: String,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub link_id: Option<String>,
    pub checkout_url: Option<String>,
    pub qr_url: Option<String>,
    /// Commission snapshot, written once when the payment becomes Paid.
    pub commission_rate: Option<Decimal>,
    pub commission_amount: Option<Decimal>,
    pub net_amount: Option<Decimal>,
}

// --- PackagePurchase ---

/// A learner's pre-purchased bundle of slot uses with one tutor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackagePurchase {
    pub id: PackageId,
    pub learner_id: String,
    pub tutor_id: String,
    pub package_template_id: i64,
    pub payment_id: Option<PaymentId>,
    pub remaining: i32,
    pub active: bool,
}

// --- RefundRequest ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Approved,
    Rejected,
}

status_labels!(RefundStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    LearnerComplaint,
    PlanChanged,
}

status_labels!(RefundReason {
    LearnerComplaint => "learner_complaint",
    PlanChanged => "plan_changed",
});

/// Bank account the refund is paid out to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BankDetails {
    pub bank_name: Option<String>,
    pub account_number: Option<String>,
    pub account_holder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub id: RefundId,
    pub slot_id: SlotId,
    pub plan_id: PlanId,
    pub learner_id: String,
    pub tutor_id: String,
    pub package_id: Option<PackageId>,
    pub payment_id: Option<PaymentId>,
    pub amount: Decimal,
    pub reason: RefundReason,
    pub note: Option<String>,
    pub evidence_url: Option<String>,
    pub bank: BankDetails,
    pub status: RefundStatus,
    pub admin_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

// --- Wallet & withdrawals ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub tutor_id: String,
    pub balance: Decimal,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Wallet {
    pub fn empty(tutor_id: &str) -> Self {
        Self {
            tutor_id: tutor_id.to_string(),
            balance: Decimal::ZERO,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
}

status_labels!(WithdrawalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// A payout from a tutor's wallet, owned by the withdrawal subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub tutor_id: String,
    pub amount: Decimal,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn locked_slot(expires_in: i64, now: DateTime<Utc>) -> Slot {
        let mut slot =
            Slot::available(1, "tutor-1", now + Duration::hours(2), now + Duration::hours(3));
        slot.id = 7;
        slot.status = SlotStatus::Locked;
        slot.learner_id = Some("learner-1".to_string());
        slot.locked_at = Some(now);
        slot.expires_at = Some(now + Duration::minutes(expires_in));
        slot
    }

    #[test]
    fn test_status_labels_round_trip() {
        for status in [
            SlotStatus::Available,
            SlotStatus::Locked,
            SlotStatus::Paid,
            SlotStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<SlotStatus>().unwrap(), status);
        }
        assert!("held".parse::<SlotStatus>().is_err());
        assert_eq!("course_purchase".parse::<PaymentType>().unwrap(), PaymentType::CoursePurchase);
    }

    #[test]
    fn test_reclaim_clears_reservation() {
        let now = Utc.with_ymd_and_hms(2025, 5, 5, 9, 0, 0).unwrap();
        let mut slot = locked_slot(10, now);
        slot.payment_id = Some(3);
        slot.reclaim();

        assert_eq!(slot.status, SlotStatus::Available);
        assert!(slot.learner_id.is_none());
        assert!(slot.payment_id.is_none());
        assert!(slot.check_invariants().is_ok());
    }

    #[test]
    fn test_lapsed_uses_expiry_boundary() {
        let now = Utc.with_ymd_and_hms(2025, 5, 5, 9, 0, 0).unwrap();
        let slot = locked_slot(10, now);
        assert!(!slot.is_lapsed(now + Duration::minutes(9)));
        assert!(slot.is_lapsed(now + Duration::minutes(10)));
    }

    #[test]
    fn test_invariants_reject_available_with_learner() {
        let now = Utc.with_ymd_and_hms(2025, 5, 5, 9, 0, 0).unwrap();
        let mut slot = locked_slot(10, now);
        slot.status = SlotStatus::Available;
        assert!(slot.check_invariants().is_err());
    }
}
