//! Property-based tests for svmontaj's pure business rules.
//!
//! No database or network access required; these always run.
//!
//! ```bash
//! cargo test --test property_tests
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! Each property is named `prop_<function>_<invariant>`.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use svmontaj::auth::normalize_phone;
use svmontaj::db::orders::OrderStatus;
use svmontaj::db::users::TariffType;
use svmontaj::tariff::{extended_expiry, split_charge};

fn tariff() -> impl Strategy<Value = TariffType> {
    prop_oneof![
        Just(TariffType::Standard),
        Just(TariffType::Comfort),
        Just(TariffType::Premium),
    ]
}

fn order_status() -> impl Strategy<Value = OrderStatus> {
    proptest::sample::select(OrderStatus::ALL.to_vec())
}

// == Phone numbers ============================================================

proptest! {
    /// Normalising an already normalised phone is a no-op.
    #[test]
    fn prop_normalize_phone_idempotent(raw in "[+]?[78]?[ (]?[3489][0-9]{2}[) -]?[0-9]{3}[ -]?[0-9]{2}[ -]?[0-9]{2}") {
        if let Some(once) = normalize_phone(&raw) {
            prop_assert_eq!(normalize_phone(&once), Some(once.clone()));
            prop_assert!(once.starts_with("+7"));
            prop_assert_eq!(once.len(), 12);
        }
    }

    /// The three common spellings of a mobile number agree.
    #[test]
    fn prop_normalize_phone_formats_agree(national in "9[0-9]{9}") {
        let plus = normalize_phone(&format!("+7{}", national));
        let eight = normalize_phone(&format!("8{}", national));
        let pretty = normalize_phone(&format!(
            "+7 ({}) {}-{}-{}",
            &national[0..3],
            &national[3..6],
            &national[6..8],
            &national[8..10]
        ));
        prop_assert_eq!(plus.clone(), Some(format!("+7{}", national)));
        prop_assert_eq!(eight, plus.clone());
        prop_assert_eq!(pretty, plus);
    }

    /// Letters never survive normalisation.
    #[test]
    fn prop_normalize_phone_rejects_letters(prefix in "[0-9]{5}", letter in "[a-zA-Z]", suffix in "[0-9]{5}") {
        prop_assert_eq!(normalize_phone(&format!("{}{}{}", prefix, letter, suffix)), None);
    }
}

// == Charges ==================================================================

proptest! {
    /// A successful split sums to the cost and never overdraws either balance.
    #[test]
    fn prop_split_charge_sums_and_stays_non_negative(
        cost in 0i64..10_000,
        bonus in 0i64..10_000,
        balance in 0i64..10_000,
    ) {
        match split_charge(cost, bonus, balance) {
            Some(charge) => {
                prop_assert_eq!(charge.total(), cost);
                prop_assert!(charge.from_bonus >= 0 && charge.from_balance >= 0);
                prop_assert!(charge.from_bonus <= bonus);
                prop_assert!(charge.from_balance <= balance);
            }
            None => prop_assert!(bonus + balance < cost),
        }
    }

    /// Bonus is spent before real money.
    #[test]
    fn prop_split_charge_bonus_first(cost in 1i64..10_000, bonus in 0i64..10_000, balance in 0i64..10_000) {
        if let Some(charge) = split_charge(cost, bonus, balance) {
            if charge.from_balance > 0 {
                prop_assert_eq!(charge.from_bonus, bonus);
            }
        }
    }
}

// == Subscriptions & orders ===================================================

proptest! {
    /// A new period always ends at least `period_days` from now.
    #[test]
    fn prop_extended_expiry_covers_a_full_period(
        current in tariff(),
        purchased in tariff(),
        offset_days in -60i64..60,
        period in 1i64..365,
    ) {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let expiry = now + Duration::days(offset_days);
        let next = extended_expiry(current, Some(expiry), purchased, now, period);
        prop_assert!(next >= now + Duration::days(period));
        if current == purchased && offset_days > 0 {
            prop_assert_eq!(next, expiry + Duration::days(period));
        }
    }

    /// No status transitions to itself, and ARCHIVED is terminal.
    #[test]
    fn prop_order_status_machine_has_no_loops(from in order_status(), to in order_status()) {
        if from == to {
            prop_assert!(!from.can_transition_to(to));
        }
        if from == OrderStatus::Archived {
            prop_assert!(!from.can_transition_to(to));
        }
        if from.can_transition_to(to) {
            prop_assert!(OrderStatus::sources_of(to).contains(&from));
        }
    }
}
