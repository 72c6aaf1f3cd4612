#[cfg(test)]
mod tests {
    use crate::money::{commission, refund_amount, slot_price};
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    // Amounts in cents, rates in basis points.
    fn amount(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    fn rate(bps: i64) -> Decimal {
        Decimal::new(bps, 4)
    }

    proptest! {
        // Commission and net always add back up to the paid amount
        #[test]
        fn test_commission_splits_exactly(cents in 1..10_000_000i64, bps in 0..=10_000i64) {
            let split = commission(amount(cents), rate(bps));
            prop_assert_eq!(split.amount + split.net, amount(cents));
            prop_assert!(split.amount >= Decimal::ZERO);
            prop_assert!(split.net >= Decimal::ZERO);
            prop_assert!(split.amount.scale() <= 2);
        }

        // Prices are in whole cents and grow with the slot length
        #[test]
        fn test_slot_price_is_monotonic(
            hourly_cents in 100..100_000i64,
            minutes in 15..240i64,
            extra in 1..60i64,
        ) {
            let hourly = amount(hourly_cents);
            let short = slot_price(hourly, minutes);
            let long = slot_price(hourly, minutes + extra);
            prop_assert!(short.scale() <= 2);
            prop_assert!(short <= long);
            prop_assert_eq!(refund_amount(hourly, minutes), short);
        }

        // A full hour costs exactly the hourly price
        #[test]
        fn test_hour_costs_hourly_price(hourly_cents in 1..100_000i64) {
            prop_assert_eq!(slot_price(amount(hourly_cents), 60), amount(hourly_cents));
        }
    }
}
