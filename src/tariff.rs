//! # Tariffs: Subscription Tiers and Balance Charging
//!
//! An executor's tariff decides how much a response to an order costs and how
//! many specializations the executor may register. STANDARD is the free tier
//! every account starts on; COMFORT and PREMIUM are bought for a fixed period
//! either from the account balance or through the payment gateway.
//!
//! The table ships with defaults and can be overridden from a TOML file:
//!
//! ```toml
//! [standard]
//! title = "Standard"
//! price = 0
//! period_days = 30
//! response_cost = 150
//! max_specializations = 1
//!
//! [comfort]
//! # ...
//! ```
//!
//! Balance charging always spends the bonus balance first and only then the
//! real balance, so promotional credit is consumed before paid money.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::db::orders::Category;
use crate::db::users::TariffType;

/// One row of the tariff table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    pub title: String,
    /// Price of one subscription period in rubles.
    pub price: i64,
    #[serde(default = "default_period_days")]
    pub period_days: i64,
    /// Charged per response to an order.
    pub response_cost: i64,
    /// `None` means every category may be selected.
    #[serde(default)]
    pub max_specializations: Option<usize>,
}

fn default_period_days() -> i64 {
    30
}

/// The full tariff table, one entry per [`TariffType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffTable {
    pub standard: Tariff,
    pub comfort: Tariff,
    pub premium: Tariff,
}

impl Default for TariffTable {
    fn default() -> Self {
        TariffTable {
            standard: Tariff {
                title: "Standard".to_string(),
                price: 0,
                period_days: 30,
                response_cost: 150,
                max_specializations: Some(1),
            },
            comfort: Tariff {
                title: "Comfort".to_string(),
                price: 990,
                period_days: 30,
                response_cost: 50,
                max_specializations: Some(3),
            },
            premium: Tariff {
                title: "Premium".to_string(),
                price: 2490,
                period_days: 30,
                response_cost: 0,
                max_specializations: None,
            },
        }
    }
}

/// Serialized view of a tariff, used by the tariffs listing endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TariffView {
    pub tariff: TariffType,
    pub title: String,
    pub price: i64,
    pub period_days: i64,
    pub response_cost: i64,
    pub max_specializations: usize,
    pub purchasable: bool,
}

impl TariffTable {
    /// Parse a table from TOML text and validate it.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let table: TariffTable = toml::from_str(raw).context("invalid tariff table")?;
        table.validate()?;
        Ok(table)
    }

    /// Load a table from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    pub fn get(&self, tariff: TariffType) -> &Tariff {
        match tariff {
            TariffType::Standard => &self.standard,
            TariffType::Comfort => &self.comfort,
            TariffType::Premium => &self.premium,
        }
    }

    /// Maximum number of specializations allowed on a tariff.
    pub fn specialization_limit(&self, tariff: TariffType) -> usize {
        self.get(tariff)
            .max_specializations
            .unwrap_or(Category::ALL.len())
            .min(Category::ALL.len())
    }

    pub fn response_cost(&self, tariff: TariffType) -> i64 {
        self.get(tariff).response_cost
    }

    /// Whether a tariff can be bought. STANDARD is free and never sold.
    pub fn is_purchasable(&self, tariff: TariffType) -> bool {
        tariff != TariffType::Standard && self.get(tariff).price > 0
    }

    pub fn views(&self) -> Vec<TariffView> {
        TariffType::ALL
            .iter()
            .map(|&t| {
                let tariff = self.get(t);
                TariffView {
                    tariff: t,
                    title: tariff.title.clone(),
                    price: tariff.price,
                    period_days: tariff.period_days,
                    response_cost: tariff.response_cost,
                    max_specializations: self.specialization_limit(t),
                    purchasable: self.is_purchasable(t),
                }
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.standard.price != 0 {
            bail!("standard tariff must be free");
        }
        for t in TariffType::ALL {
            let tariff = self.get(t);
            if tariff.price < 0 {
                bail!("{} price must not be negative", t);
            }
            if tariff.response_cost < 0 {
                bail!("{} response_cost must not be negative", t);
            }
            if tariff.period_days <= 0 {
                bail!("{} period_days must be positive", t);
            }
            if tariff.max_specializations == Some(0) {
                bail!("{} must allow at least one specialization", t);
            }
            if t != TariffType::Standard && tariff.price == 0 {
                bail!("{} must have a positive price", t);
            }
        }
        Ok(())
    }
}

/// How a charge is split between the bonus and the real balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Charge {
    pub from_bonus: i64,
    pub from_balance: i64,
}

impl Charge {
    pub fn total(&self) -> i64 {
        self.from_bonus + self.from_balance
    }
}

/// Split `cost` across the two balances, bonus first.
///
/// Returns `None` when the two balances together cannot cover the cost.
pub fn split_charge(cost: i64, bonus: i64, balance: i64) -> Option<Charge> {
    if cost <= 0 {
        return Some(Charge::default());
    }
    let bonus = bonus.max(0);
    let balance = balance.max(0);
    let from_bonus = cost.min(bonus);
    let from_balance = cost - from_bonus;
    if from_balance > balance {
        return None;
    }
    Some(Charge {
        from_bonus,
        from_balance,
    })
}

/// Compute the expiry of a newly activated subscription.
///
/// Buying the tariff the user already holds extends the running period;
/// switching tariffs, or renewing an expired one, starts a fresh period now.
pub fn extended_expiry(
    current: TariffType,
    current_expiry: Option<DateTime<Utc>>,
    purchased: TariffType,
    now: DateTime<Utc>,
    period_days: i64,
) -> DateTime<Utc> {
    let period = Duration::days(period_days);
    match current_expiry {
        Some(expiry) if current == purchased && expiry > now => expiry + period,
        _ => now + period,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_valid() {
        let table = TariffTable::default();
        table.validate().unwrap();
        assert_eq!(table.specialization_limit(TariffType::Standard), 1);
        assert_eq!(table.specialization_limit(TariffType::Comfort), 3);
        assert_eq!(
            table.specialization_limit(TariffType::Premium),
            Category::ALL.len()
        );
        assert!(!table.is_purchasable(TariffType::Standard));
        assert!(table.is_purchasable(TariffType::Premium));
    }

    #[test]
    fn toml_overrides_parse() {
        let raw = r#"
            [standard]
            title = "Base"
            price = 0
            response_cost = 200
            max_specializations = 2

            [comfort]
            title = "Comfort"
            price = 1500
            period_days = 60
            response_cost = 20
            max_specializations = 4

            [premium]
            title = "Premium"
            price = 3000
            response_cost = 0
        "#;
        let table = TariffTable::from_toml_str(raw).unwrap();
        assert_eq!(table.standard.period_days, 30);
        assert_eq!(table.comfort.period_days, 60);
        assert_eq!(table.response_cost(TariffType::Standard), 200);
        assert_eq!(table.premium.max_specializations, None);
    }

    #[test]
    fn paid_standard_is_rejected() {
        let raw = r#"
            [standard]
            title = "Base"
            price = 10
            response_cost = 200
            [comfort]
            title = "Comfort"
            price = 1500
            response_cost = 20
            [premium]
            title = "Premium"
            price = 3000
            response_cost = 0
        "#;
        let err = TariffTable::from_toml_str(raw).unwrap_err();
        assert!(format!("{:#}", err).contains("standard tariff must be free"));
    }

    #[test]
    fn zero_specializations_rejected() {
        let mut table = TariffTable::default();
        table.comfort.max_specializations = Some(0);
        assert!(table.validate().is_err());
    }

    #[test]
    fn charge_spends_bonus_first() {
        let charge = split_charge(150, 100, 500).unwrap();
        assert_eq!(charge.from_bonus, 100);
        assert_eq!(charge.from_balance, 50);
        assert_eq!(charge.total(), 150);
    }

    #[test]
    fn charge_fully_covered_by_bonus() {
        let charge = split_charge(50, 300, 0).unwrap();
        assert_eq!(
            charge,
            Charge {
                from_bonus: 50,
                from_balance: 0
            }
        );
    }

    #[test]
    fn charge_insufficient_funds() {
        assert_eq!(split_charge(150, 100, 49), None);
    }

    #[test]
    fn zero_cost_is_free() {
        assert_eq!(split_charge(0, 0, 0), Some(Charge::default()));
    }

    #[test]
    fn same_tariff_extends_running_period() {
        let now = Utc::now();
        let expiry = now + Duration::days(10);
        let next = extended_expiry(
            TariffType::Comfort,
            Some(expiry),
            TariffType::Comfort,
            now,
            30,
        );
        assert_eq!(next, expiry + Duration::days(30));
    }

    #[test]
    fn switching_tariff_restarts_period() {
        let now = Utc::now();
        let expiry = now + Duration::days(10);
        let next = extended_expiry(
            TariffType::Comfort,
            Some(expiry),
            TariffType::Premium,
            now,
            30,
        );
        assert_eq!(next, now + Duration::days(30));
    }

    #[test]
    fn expired_subscription_restarts_period() {
        let now = Utc::now();
        let next = extended_expiry(
            TariffType::Comfort,
            Some(now - Duration::days(1)),
            TariffType::Comfort,
            now,
            30,
        );
        assert_eq!(next, now + Duration::days(30));
    }
}
