use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff shared by enrichment retries and the sync drain.
///
/// `delay(n)` is `base * 2^(n-1)` capped at `max`, then spread by up to
/// `jitter` (a fraction) in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_ms: u64::try_from(base.as_millis()).unwrap_or(u64::MAX),
            max_ms: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
            jitter: 0.0,
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based) without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_ms
            .saturating_mul(1_u64 << exp)
            .min(self.max_ms);
        Duration::from_millis(ms)
    }

    /// `base_delay` with jitter applied. Settings may carry any `jitter`, so
    /// it is clamped to `0..=1` here.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter.is_nan() || self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let jitter = self.jitter.min(1.0);
        let spread = rand::rng().random_range(-jitter..=jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + spread)).unwrap_or(base)
    }
}
