// --- File: crates/tutorbook_booking/src/money.rs ---
//! Price, refund and commission arithmetic. All results are rounded half-up to cents.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

const MINUTES_PER_HOUR: i64 = 60;

/// Rounds to 2 decimal places, ties away from zero.
pub fn round_half_up(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

/// Price of a slot of `minutes` at `hourly_price`.
pub fn slot_price(hourly_price: Decimal, minutes: i64) -> Decimal {
    round_half_up(hourly_price * Decimal::from(minutes) / Decimal::from(MINUTES_PER_HOUR))
}

/// Amount returned to the learner when a paid slot is disputed or invalidated.
pub fn refund_amount(hourly_price: Decimal, minutes: i64) -> Decimal {
    slot_price(hourly_price, minutes)
}

/// Commission snapshot stored on a payment when it is marked paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    pub rate: Decimal,
    pub amount: Decimal,
    pub net: Decimal,
}

pub fn commission(amount: Decimal, rate: Decimal) -> Commission {
    let commission = round_half_up(amount * rate);
    Commission {
        rate,
        amount: commission,
        net: amount - commission,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_refund_for_half_hour() {
        let refund = refund_amount(dec!(100000), 30);
        assert_eq!(refund, dec!(50000.00));
        assert_eq!(refund.to_string(), "50000.00");
    }

    #[test]
    fn test_rounding_is_half_up() {
        assert_eq!(round_half_up(dec!(1.005)), dec!(1.01));
        assert_eq!(round_half_up(dec!(1.004)), dec!(1.00));
        assert_eq!(slot_price(dec!(25), 50), dec!(20.83));
        assert_eq!(slot_price(dec!(0.25), 6), dec!(0.03));
    }

    #[test]
    fn test_commission_split() {
        let split = commission(dec!(80.00), dec!(0.10));
        assert_eq!(split.amount, dec!(8.00));
        assert_eq!(split.net, dec!(72.00));

        let split = commission(dec!(33.35), dec!(0.15));
        assert_eq!(split.amount, dec!(5.00));
        assert_eq!(split.net, dec!(28.35));
    }
}
