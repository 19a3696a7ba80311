use governor::{
    Quota, RateLimiter as GovernorRateLimiter,
    clock::{QuantaClock, QuantaInstant},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
};
use nonzero_ext::nonzero;
use std::{num::NonZeroU32, time::Duration};

pub const DEFAULT_REQ_PER_MIN: NonZeroU32 = nonzero!(20u32);
pub const DEFAULT_MIN_SPACING: Duration = Duration::from_millis(750);

type SpecificGovernorRateLimiter =
    GovernorRateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>;

/// Process-wide outbound pacing shared by every worker of a scrape client.
pub struct RateLimiter {
    req_per_min: SpecificGovernorRateLimiter,
    min_spacing: Option<SpecificGovernorRateLimiter>,
}

impl RateLimiter {
    pub fn new(req_per_min: NonZeroU32, min_spacing: Duration) -> Self {
        // Limit to X total req/min on average.
        let req_per_min = GovernorRateLimiter::direct(Quota::per_minute(req_per_min));

        // No two requests closer than Y. A zero spacing disables the check.
        let min_spacing = Quota::with_period(min_spacing).map(GovernorRateLimiter::direct);

        RateLimiter {
            req_per_min,
            min_spacing,
        }
    }

    pub async fn wait_until_ready(&self) {
        // Throughput first, then spacing: callers released together by the
        // per-minute bucket still leave one at a time through the spacing gate.
        self.req_per_min.until_ready().await;
        if let Some(spacing) = &self.min_spacing {
            spacing.until_ready().await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQ_PER_MIN, DEFAULT_MIN_SPACING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_first_request_is_immediate() {
        let limiter = RateLimiter::default();
        let start = Instant::now();
        limiter.wait_until_ready().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_spacing_delays_second_request() {
        let limiter = RateLimiter::new(nonzero!(600u32), Duration::from_millis(120));
        limiter.wait_until_ready().await;
        let start = Instant::now();
        limiter.wait_until_ready().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_zero_spacing_disables_gate() {
        let limiter = RateLimiter::new(nonzero!(6000u32), Duration::ZERO);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait_until_ready().await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
