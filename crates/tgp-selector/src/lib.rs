//! Pure offer selection.
//!
//! No I/O: given a set of offers already fetched by an adapter and a
//! request's constraints, deterministically pick the best one or explain
//! why none qualify.

use std::cmp::Ordering;

use rust_decimal::Decimal;
use tgp_types::{GpuOffer, OfferFilters};
use thiserror::Error;

/// Minimum memory a candidate offer must provide; `0` means no floor.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub filters: OfferFilters,
    pub memory_floor_gb: u32,
    pub preferred_provider: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no eligible offer: {reason}")]
pub struct NoEligibleOffer {
    pub reason: String,
}

/// Rejects offers failing any hard filter, then ranks the rest by lowest
/// hourly price, breaking ties by (1) preferred vendor, (2) larger memory,
/// (3) lexicographic offer id, for determinism under tests.
pub fn select_offer(offers: &[GpuOffer], criteria: &SelectionCriteria) -> Result<GpuOffer, NoEligibleOffer> {
    let mut eligible: Vec<&GpuOffer> = offers
        .iter()
        .filter(|offer| criteria.filters.matches(offer))
        .filter(|offer| offer.memory_gb >= criteria.memory_floor_gb)
        .collect();

    if eligible.is_empty() {
        return Err(NoEligibleOffer {
            reason: ineligibility_reason(offers, criteria),
        });
    }

    eligible.sort_by(|a, b| compare_offers(a, b, criteria));
    Ok(eligible[0].clone())
}

fn compare_offers(a: &GpuOffer, b: &GpuOffer, criteria: &SelectionCriteria) -> Ordering {
    let price_a = effective_price(a);
    let price_b = effective_price(b);
    price_a
        .cmp(&price_b)
        .then_with(|| preferred_rank(a, criteria).cmp(&preferred_rank(b, criteria)))
        .then_with(|| b.memory_gb.cmp(&a.memory_gb))
        .then_with(|| a.offer_id.cmp(&b.offer_id))
}

fn preferred_rank(offer: &GpuOffer, criteria: &SelectionCriteria) -> u8 {
    match &criteria.preferred_provider {
        Some(preferred) if preferred == &offer.provider => 0,
        Some(_) => 1,
        None => 0,
    }
}

fn effective_price(offer: &GpuOffer) -> Decimal {
    tgp_types::offer::effective_price(offer)
        .parse()
        .unwrap_or(Decimal::MAX)
}

fn ineligibility_reason(offers: &[GpuOffer], criteria: &SelectionCriteria) -> String {
    if offers.is_empty() {
        return format!("no offers available for {}", criteria.filters.gpu_type);
    }
    if offers.iter().all(|o| o.gpu_type != criteria.filters.gpu_type) {
        return format!("no offers matched gpu_type {}", criteria.filters.gpu_type);
    }
    if let Some(max) = criteria.filters.max_hourly_price {
        if offers
            .iter()
            .all(|o| effective_price(o) > max)
        {
            return format!("all offers exceeded price ceiling {max}");
        }
    }
    if offers.iter().all(|o| o.memory_gb < criteria.memory_floor_gb) {
        return format!("no offers met memory floor {} GB", criteria.memory_floor_gb);
    }
    "no offers satisfied all filters".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(id: &str, provider: &str, price: &str, memory_gb: u32) -> GpuOffer {
        GpuOffer {
            offer_id: id.to_string(),
            provider: provider.to_string(),
            gpu_type: "H100".to_string(),
            gpu_count: 1,
            region: "us-east".to_string(),
            hourly_price: price.to_string(),
            spot_price: None,
            memory_gb,
            storage_gb: 100,
            is_spot: false,
            available: true,
        }
    }

    #[test]
    fn selects_cheapest_eligible_offer() {
        let offers = vec![offer("b", "runpod", "0.80", 40), offer("a", "vastai", "0.50", 40)];
        let criteria = SelectionCriteria {
            filters: OfferFilters {
                gpu_type: "H100".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let chosen = select_offer(&offers, &criteria).unwrap();
        assert_eq!(chosen.offer_id, "a");
    }

    #[test]
    fn ties_break_on_preferred_provider_then_memory_then_id() {
        let offers = vec![
            offer("z", "runpod", "0.50", 40),
            offer("a", "vastai", "0.50", 80),
        ];
        let criteria = SelectionCriteria {
            filters: OfferFilters {
                gpu_type: "H100".to_string(),
                ..Default::default()
            },
            preferred_provider: Some("vastai".to_string()),
            ..Default::default()
        };
        let chosen = select_offer(&offers, &criteria).unwrap();
        assert_eq!(chosen.offer_id, "a");
    }

    #[test]
    fn ties_without_preference_fall_back_to_memory_then_id() {
        let offers = vec![
            offer("z", "runpod", "0.50", 40),
            offer("a", "vastai", "0.50", 80),
        ];
        let criteria = SelectionCriteria {
            filters: OfferFilters {
                gpu_type: "H100".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let chosen = select_offer(&offers, &criteria).unwrap();
        assert_eq!(chosen.offer_id, "a");
    }

    #[test]
    fn price_ceiling_rejecting_everything_reports_why() {
        let offers = vec![offer("a", "runpod", "2.00", 40)];
        let criteria = SelectionCriteria {
            filters: OfferFilters {
                gpu_type: "H100".to_string(),
                max_hourly_price: Some("0.01".parse().unwrap()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = select_offer(&offers, &criteria).unwrap_err();
        assert!(err.reason.contains("price ceiling"));
    }

    #[test]
    fn selection_is_deterministic_across_repeated_calls() {
        let offers = vec![offer("b", "runpod", "0.50", 40), offer("a", "vastai", "0.50", 40)];
        let criteria = SelectionCriteria {
            filters: OfferFilters {
                gpu_type: "H100".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let first = select_offer(&offers, &criteria).unwrap();
        let second = select_offer(&offers, &criteria).unwrap();
        assert_eq!(first.offer_id, second.offer_id);
    }

    proptest::proptest! {
        #[test]
        fn selector_is_deterministic_for_arbitrary_offer_sets(
            prices in proptest::collection::vec(1u32..500, 1..10),
        ) {
            let offers: Vec<GpuOffer> = prices
                .iter()
                .enumerate()
                .map(|(i, cents)| offer(&format!("offer-{i}"), "runpod", &format!("{:.2}", *cents as f64 / 100.0), 40))
                .collect();
            let criteria = SelectionCriteria {
                filters: OfferFilters {
                    gpu_type: "H100".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            };
            let first = select_offer(&offers, &criteria).unwrap();
            let second = select_offer(&offers, &criteria).unwrap();
            proptest::prop_assert_eq!(first.offer_id, second.offer_id);
        }
    }
}
