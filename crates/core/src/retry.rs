//! Retry backoff policies.
//!
//! The curve is a policy parameter, not fixed: the pool and the reaper
//! take any [`BackoffPolicy`]. The default is exponential with jitter.

use rand::Rng;
use std::time::Duration;

/// Computes the delay before a failed attempt is retried.
pub trait BackoffPolicy: Send + Sync {
    /// Delay before the next execution, given the attempt count just
    /// consumed (1-based: `attempt = 1` after the first failure).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with multiplicative jitter.
///
/// The default policy: `base * factor^(attempt - 1)`, capped at `max`,
/// then scaled by a random factor in `[1 - jitter, 1 + jitter]`.
/// Defaults: base 10s, factor 2, max 1h, jitter 0.1.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay after the first failure.
    pub base: Duration,
    /// Multiplier applied per additional attempt.
    pub factor: u32,
    /// Upper bound on the pre-jitter delay.
    pub max: Duration,
    /// Jitter fraction in `[0, 1)`.
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            factor: 2,
            max: Duration::from_secs(3600),
            jitter: 0.1,
        }
    }
}

impl ExponentialBackoff {
    /// Constant-ish policy with no growth and no jitter, mostly for
    /// tests and aggressive-retry setups.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            factor: 1,
            max: delay,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = (self.factor as u64).saturating_pow(exp);
        let raw = self
            .base
            .saturating_mul(factor.min(u32::MAX as u64) as u32)
            .min(self.max);

        if self.jitter <= 0.0 {
            return raw;
        }
        let scale = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        raw.mul_f64(scale)
    }
}
