//! Failure-specific retry and backoff decisions.
//!
//! | Failure         | Retries | Backoff for retry n (1-based)              |
//! |-----------------|---------|--------------------------------------------|
//! | HTTP 403        | 0       | classified `block` immediately             |
//! | HTTP 429        | 3       | `[r·2^(n-1), 1.5·r·2^(n-1)]`, r = 60s      |
//! | HTTP 5xx        | 3       | `s·2^(n-1)` + up to 10%, s = 2s            |
//! | timeout         | 2       | `t·2^(n-1)` + up to 10%, t = 5s            |
//! | anything else   | 0       |                                            |
//!
//! The engine only decides; sleeping is the caller's job.

use std::time::Duration;

use crate::delay;
use crate::models::EventClass;

/// What went wrong on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Status(u16),
    Timeout,
    /// Connection refused, DNS, TLS and every other transport error.
    Network,
}

impl Failure {
    /// Event classification for this failure when it is logged.
    pub fn event_class(&self) -> EventClass {
        match self {
            Failure::Status(403) => EventClass::Block,
            Failure::Timeout => EventClass::Timeout,
            _ => EventClass::Error,
        }
    }
}

/// Backoff window: the delay is drawn from `[base, base + spread]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub spread: Duration,
}

impl Backoff {
    pub fn sample(&self) -> Duration {
        delay::jittered(self.base, self.spread)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Backoff),
    GiveUp,
    /// Active blocking: never retried.
    Block,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub rate_limit_base: Duration,
    pub rate_limit_retries: u32,
    pub server_error_base: Duration,
    pub server_error_retries: u32,
    pub timeout_base: Duration,
    pub timeout_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_base: Duration::from_secs(60),
            rate_limit_retries: 3,
            server_error_base: Duration::from_millis(2000),
            server_error_retries: 3,
            timeout_base: Duration::from_millis(5000),
            timeout_retries: 2,
        }
    }
}

impl RetryPolicy {
    /// Decides what to do after `attempt` (0-based) failed with `failure`.
    /// `attempt == 0` is the initial request, so the first retry is n = 1.
    pub fn decide(&self, failure: Failure, attempt: u32) -> RetryDecision {
        let retry = attempt + 1;
        match failure {
            Failure::Status(403) => RetryDecision::Block,
            Failure::Status(429) if retry <= self.rate_limit_retries => {
                let base = exponential(self.rate_limit_base, retry);
                RetryDecision::Retry(Backoff {
                    base,
                    spread: base / 2,
                })
            }
            // 429 exhausted is treated as blocking for classification.
            Failure::Status(429) => RetryDecision::Block,
            Failure::Status(s) if (500..600).contains(&s) && retry <= self.server_error_retries => {
                let base = exponential(self.server_error_base, retry);
                RetryDecision::Retry(Backoff {
                    base,
                    spread: base / 10,
                })
            }
            Failure::Timeout if retry <= self.timeout_retries => {
                let base = exponential(self.timeout_base, retry);
                RetryDecision::Retry(Backoff {
                    base,
                    spread: base / 10,
                })
            }
            _ => RetryDecision::GiveUp,
        }
    }
}

fn exponential(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(1u32 << (retry.saturating_sub(1)).min(16))
}
