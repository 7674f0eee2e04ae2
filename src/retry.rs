use rand::Rng;
use std::time::Duration;

use crate::backend::Failure;
use crate::config::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_SECS};

/// Exponential backoff with jitter around a single backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per task, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Decide what happens after `attempt` (1-based) ended in `failure`.
    pub fn decide(&self, attempt: u32, failure: &Failure) -> RetryDecision {
        if !failure.kind.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt, failure.retry_after))
    }

    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let jitter = random_jitter(self.base_delay);
        self.delay_with_jitter(attempt, jitter, retry_after)
    }

    /// `base * 2^(attempt-1) + jitter`, capped at `max_delay`. A larger
    /// retry-after hint from the backend wins over the computed delay.
    pub fn delay_with_jitter(
        &self,
        attempt: u32,
        jitter: Duration,
        retry_after: Option<Duration>,
    ) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .saturating_add(jitter)
            .min(self.max_delay);

        match retry_after {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }
}

/// Uniform in `[0, base)`.
fn random_jitter(base: Duration) -> Duration {
    let micros = base.as_micros() as u64;
    if micros == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    Duration::from_micros(rng.gen_range(0..micros))
}
