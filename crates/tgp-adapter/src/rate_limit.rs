//! Per-adapter request throttling.
//!
//! Each [`crate::adapter::ProviderAdapter`] owns one of these, sized to the
//! vendor-documented request budget. Unlike the sliding-window limiter used
//! elsewhere in this codebase, this is a token bucket: bursts up to
//! `burst` are allowed immediately, then requests drain at
//! `requests_per_second`.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AdapterError;
use crate::types::RateLimits;

type Inner = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limits: RateLimits) -> Self {
        let per_second = NonZeroU32::new(limits.requests_per_second.max(1)).unwrap();
        let burst = NonZeroU32::new(limits.burst.max(1)).unwrap();
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self {
            inner: Arc::new(GovernorLimiter::direct(quota)),
        }
    }

    /// Waits for a slot, or returns `Cancelled` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AdapterError> {
        loop {
            match self.inner.check() {
                Ok(()) => return Ok(()),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
                    debug!(?wait, "rate limit: waiting for a free slot");
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = cancel.cancelled() => return Err(AdapterError::Cancelled),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_allowed_immediately() {
        let limiter = RateLimiter::new(RateLimits {
            requests_per_second: 1,
            burst: 3,
        });
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            limiter.acquire(&cancel).await.unwrap();
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_wait() {
        let limiter = RateLimiter::new(RateLimits {
            requests_per_second: 1,
            burst: 1,
        });
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        cancel.cancel();
        let result = limiter.acquire(&cancel).await;
        assert!(matches!(result, Err(AdapterError::Cancelled)));
    }
}
