use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a provider quotes its price; the cache normalizes all three down to
/// a canonical per-second rate so callers never branch on billing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BillingModel {
    PerSecond,
    PerMinute,
    PerHour,
}

/// A price quote normalized to both per-second and per-hour rates, as
/// produced by the pricing cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPricing {
    pub price_per_second: Decimal,
    pub price_per_hour: Decimal,
    pub currency: String,
    pub billing_model: BillingModel,
    pub last_updated: DateTime<Utc>,
}

impl NormalizedPricing {
    /// Normalizes a raw quoted price into the canonical representation.
    ///
    /// `per_minute` quotes are first converted to an hourly rate (`* 60`)
    /// then to per-second (`/ 3600`), rather than going through per-second
    /// directly, so rounding matches what a human auditing the hourly
    /// figure would expect.
    pub fn from_quote(
        raw_price: &str,
        billing_model: BillingModel,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, rust_decimal::Error> {
        let raw = Decimal::from_str(raw_price)?;
        let price_per_hour = match billing_model {
            BillingModel::PerHour => raw,
            BillingModel::PerMinute => raw * Decimal::from(60),
            BillingModel::PerSecond => raw * Decimal::from(3600),
        };
        let price_per_second = price_per_hour / Decimal::from(3600);
        Ok(Self {
            price_per_second,
            price_per_hour,
            currency: currency.into(),
            billing_model,
            last_updated: now,
        })
    }
}
