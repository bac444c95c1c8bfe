//! Centralized retry/backoff policy.
//!
//! One [`RetryPolicy`] shape is shared by the task queue, the remote poller
//! and the notification dispatcher. Delays grow as `base × 2^attempt`, are
//! capped at `max_delay`, and carry up to `jitter_ratio` of extra random
//! delay. With a ratio of at most 1 the sequence of delays never decreases.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 600_000,
            max_attempts: 5,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32, jitter_ratio: f64) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            max_attempts,
            jitter_ratio,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let cap = self.max_delay_ms.max(self.base_delay_ms);
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(cap))
    }

    /// Delay before retry number `attempt` using `unit` in `[0, 1]` as the
    /// jitter draw.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let nominal = self.nominal_delay(attempt).as_millis() as f64;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let jitter = nominal * ratio * unit.clamp(0.0, 1.0);
        let cap = self.max_delay().as_millis() as f64;
        Duration::from_millis((nominal + jitter).min(cap) as u64)
    }

    /// Delay before retry number `attempt` with a random jitter draw.
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with(attempt, unit)
    }

    /// Whether `attempts` failed executions use up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Fatal configuration problems, if any.
    pub fn validate(&self, section: &str) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err(format!("{section}.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(format!(
                "{section}.jitter_ratio must be between 0 and 1 (got {})",
                self.jitter_ratio
            ));
        }
        Ok(())
    }
}
