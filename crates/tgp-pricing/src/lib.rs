//! Single-flight, TTL-bounded pricing cache.
//!
//! Maps `(provider, gpu_type, region)` to a [`NormalizedPricing`] quote.
//! Concurrent lookups for the same key while a fetch is in flight share one
//! upstream call via an in-flight map of broadcast receivers, rather than a
//! per-key mutex: the first caller becomes the fetcher and broadcasts the
//! result to every other caller waiting on the same key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tgp_types::NormalizedPricing;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("upstream fetch failed: {0}")]
    Fetch(String),

    #[error("in-flight broadcast closed before a result arrived")]
    Coalesced,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CacheKey {
    pub provider: String,
    pub gpu_type: String,
    pub region: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(provider: impl Into<String>, gpu_type: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            gpu_type: gpu_type.into(),
            region: region.into(),
        }
    }
}

struct Entry {
    pricing: NormalizedPricing,
}

/// A pending fetch that other callers for the same key can subscribe to.
type InFlight = broadcast::Sender<Result<NormalizedPricing, String>>;

pub struct PricingCache {
    ttl: Duration,
    entries: Arc<DashMap<CacheKey, Entry>>,
    in_flight: Arc<DashMap<CacheKey, InFlight>>,
}

impl PricingCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Returns a cached, non-stale entry, or drives exactly one upstream
    /// fetch (via `fetch`) even if many callers race on the same key.
    pub async fn get<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<NormalizedPricing, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<NormalizedPricing, String>>,
    {
        if let Some(entry) = self.entries.get(key) {
            if !self.is_stale(&entry.pricing) {
                debug!(?key, "pricing cache hit");
                return Ok(entry.pricing.clone());
            }
        }

        // Fast path: someone else is already fetching this key.
        if let Some(sender) = self.in_flight.get(key) {
            let mut receiver = sender.subscribe();
            drop(sender);
            return Self::await_broadcast(&mut receiver).await;
        }

        // Become the fetcher. `entry()` makes the insert-if-absent check and
        // the insert atomic, so only one task wins the race.
        let (tx, _rx) = broadcast::channel(1);
        let became_fetcher = match self.in_flight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let mut receiver = existing.get().subscribe();
                drop(existing);
                return Self::await_broadcast(&mut receiver).await;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx.clone());
                true
            }
        };
        debug_assert!(became_fetcher);

        debug!(?key, "pricing cache miss, fetching upstream");
        let result = fetch().await;
        self.in_flight.remove(key);

        match &result {
            Ok(pricing) => {
                self.entries.insert(
                    key.clone(),
                    Entry {
                        pricing: pricing.clone(),
                    },
                );
            }
            Err(_) => {
                // Do not poison the key on failure; the next lookup retries.
            }
        }

        let _ = tx.send(result.clone());
        result.map_err(CacheError::Fetch)
    }

    async fn await_broadcast(
        receiver: &mut broadcast::Receiver<Result<NormalizedPricing, String>>,
    ) -> Result<NormalizedPricing, CacheError> {
        match receiver.recv().await {
            Ok(Ok(pricing)) => Ok(pricing),
            Ok(Err(e)) => Err(CacheError::Fetch(e)),
            Err(_) => Err(CacheError::Coalesced),
        }
    }

    fn is_stale(&self, pricing: &NormalizedPricing) -> bool {
        let age = Utc::now().signed_duration_since(pricing.last_updated);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }

    /// Evicts every entry whose TTL has expired. Lazy eviction on lookup
    /// already guarantees correctness; this is only for bounding memory
    /// when a key is requested rarely after going stale.
    pub fn sweep(&self) {
        self.entries.retain(|_, entry| !self.is_stale(&entry.pricing));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tgp_types::BillingModel;

    fn pricing(price: &str) -> NormalizedPricing {
        NormalizedPricing::from_quote(price, BillingModel::PerHour, "USD", Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn caches_a_successful_fetch() {
        let cache = PricingCache::new(Duration::from_secs(60));
        let key = CacheKey::new("runpod", "H100", "us-east");
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let result = cache
                .get(&key, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(pricing("0.50"))
                })
                .await
                .unwrap();
            assert_eq!(result.price_per_hour.to_string(), "0.50");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_coalesce_into_one_upstream_call() {
        let cache = Arc::new(PricingCache::new(Duration::from_secs(60)));
        let key = CacheKey::new("runpod", "H100", "us-east");
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let key = key.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get(&key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(pricing("0.80"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.price_per_hour.to_string(), "0.80");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_failure_does_not_poison_the_key() {
        let cache = PricingCache::new(Duration::from_secs(60));
        let key = CacheKey::new("runpod", "H100", "us-east");

        let first = cache.get(&key, || async { Err("boom".to_string()) }).await;
        assert!(first.is_err());

        let second = cache.get(&key, || async { Ok(pricing("0.50")) }).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn stale_entry_triggers_a_refresh() {
        let cache = PricingCache::new(Duration::from_millis(10));
        let key = CacheKey::new("runpod", "H100", "us-east");

        cache.get(&key, || async { Ok(pricing("0.50")) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = cache
            .get(&key, || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(pricing("0.60"))
            })
            .await
            .unwrap();

        assert_eq!(result.price_per_hour.to_string(), "0.60");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
