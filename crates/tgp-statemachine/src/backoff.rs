//! Exponential backoff with jitter for requeueing a failed reconcile.
//!
//! Unlike a bounded retry loop, a watch-driven reconciler never gives up: it
//! keeps requeueing at a growing interval until the next real change (a
//! watch event, or the object's own `max_delay`-capped timer) arrives. So
//! there is no `max_attempts` here, only the `initial_delay` /
//! `backoff_multiplier` / `max_delay` shape.

use std::time::Duration;

/// Requeue timing for transient reconcile failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the `attempt`-th requeue (`attempt` starts at 1),
    /// capped at `max_delay`, plus up to 20% jitter so many stuck objects
    /// don't all wake the controller on the same tick.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, jitter_fraction: f64) -> Duration {
        let unjittered = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = unjittered.min(self.max_delay.as_secs_f64());
        let jittered = capped * (1.0 + jitter_fraction.clamp(0.0, 1.0) * 0.2);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64() * 1.2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_the_initial_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1, 0.0), Duration::from_secs(1));
    }

    #[test]
    fn delay_doubles_each_attempt_until_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(2, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, 0.0), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4, 0.0), Duration::from_secs(8));
    }

    #[test]
    fn delay_never_exceeds_the_cap_even_with_jitter() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay_for(100, 1.0);
        assert!(delay <= Duration::from_secs_f64(300.0 * 1.2));
    }

    #[test]
    fn jitter_only_adds_time_never_subtracts() {
        let policy = BackoffPolicy::default();
        let unjittered = policy.delay_for(3, 0.0);
        let jittered = policy.delay_for(3, 1.0);
        assert!(jittered >= unjittered);
    }
}
