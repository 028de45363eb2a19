use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single bookable unit of capacity as reported by a provider adapter,
/// already translated into the standard vocabulary (§4.1): vendor GPU model
/// names and region codes never cross this boundary unmapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GpuOffer {
    /// Opaque, provider-scoped identifier; stable enough to re-request the
    /// same SKU but not guaranteed stable across adapter restarts.
    pub offer_id: String,
    pub provider: String,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub region: String,

    /// Decimal string, on-demand hourly price in USD.
    pub hourly_price: String,
    /// Decimal string, spot/interruptible hourly price, when offered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_price: Option<String>,

    pub memory_gb: u32,
    pub storage_gb: u32,
    pub is_spot: bool,
    pub available: bool,
}

/// Selector input: the constraints a [`crate::GPURequestSpec`] imposes on
/// candidate offers, already resolved against process-level defaults.
#[derive(Debug, Clone, Default)]
pub struct OfferFilters {
    pub gpu_type: String,
    pub region: Option<String>,
    pub max_hourly_price: Option<rust_decimal::Decimal>,
    pub want_spot: bool,
}

impl OfferFilters {
    #[must_use]
    pub fn matches(&self, offer: &GpuOffer) -> bool {
        if !offer.available {
            return false;
        }
        if offer.gpu_type != self.gpu_type {
            return false;
        }
        if let Some(region) = &self.region {
            if &offer.region != region {
                return false;
            }
        }
        if offer.is_spot != self.want_spot {
            return false;
        }
        if let Some(max) = self.max_hourly_price {
            let Ok(price) = effective_price(offer).parse::<rust_decimal::Decimal>() else {
                return false;
            };
            if price > max {
                return false;
            }
        }
        true
    }
}

/// The price that actually applies to an offer: spot price when the offer
/// is spot and quotes one, on-demand price otherwise.
#[must_use]
pub fn effective_price(offer: &GpuOffer) -> String {
    if offer.is_spot {
        offer
            .spot_price
            .clone()
            .unwrap_or_else(|| offer.hourly_price.clone())
    } else {
        offer.hourly_price.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(gpu_type: &str, region: &str, price: &str, is_spot: bool) -> GpuOffer {
        GpuOffer {
            offer_id: "o-1".to_string(),
            provider: "runpod".to_string(),
            gpu_type: gpu_type.to_string(),
            gpu_count: 1,
            region: region.to_string(),
            hourly_price: price.to_string(),
            spot_price: None,
            memory_gb: 24,
            storage_gb: 100,
            is_spot,
            available: true,
        }
    }

    #[test]
    fn filters_reject_wrong_gpu_type() {
        let filters = OfferFilters {
            gpu_type: "H100".to_string(),
            ..Default::default()
        };
        assert!(!filters.matches(&offer("A100", "us-east", "1.00", false)));
    }

    #[test]
    fn filters_reject_over_budget() {
        let filters = OfferFilters {
            gpu_type: "H100".to_string(),
            max_hourly_price: Some("0.50".parse().unwrap()),
            ..Default::default()
        };
        assert!(!filters.matches(&offer("H100", "us-east", "0.80", false)));
        assert!(filters.matches(&offer("H100", "us-east", "0.50", false)));
    }

    #[test]
    fn filters_reject_unavailable() {
        let filters = OfferFilters {
            gpu_type: "H100".to_string(),
            ..Default::default()
        };
        let mut o = offer("H100", "us-east", "0.50", false);
        o.available = false;
        assert!(!filters.matches(&o));
    }
}
