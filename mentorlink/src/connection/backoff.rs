//! Reconnection backoff policy.
//!
//! Pure delay arithmetic, kept separate from the timers that consume it so
//! the formula is testable in isolation from real time.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
///
/// The raw delay for attempt `n` (0-indexed) is `min(base * 2^n, max)`,
/// then perturbed by up to ±`jitter` (uniform) and clamped back under
/// `max_delay`, so many clients knocked offline together do not reconnect
/// in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay for attempt 0.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Jitter band as a fraction (0.3 = ±30%).
    pub jitter: f64,
    /// Attempts after which auto-reconnect gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.3,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Pre-jitter delay for the given attempt: `min(base * 2^n, max)`.
    #[must_use]
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        let multiplier = 1u128.checked_shl(attempt).unwrap_or(u128::MAX);
        let raw_ms = base_ms
            .saturating_mul(multiplier)
            .min(self.max_delay.as_millis());
        // raw_ms is bounded by max_delay, which fits u64 milliseconds.
        Duration::from_millis(u64::try_from(raw_ms).unwrap_or(u64::MAX))
    }

    /// Jittered delay for the given attempt.
    ///
    /// Uniform in `[raw * (1 - jitter), raw * (1 + jitter)]`, clamped to
    /// `max_delay`; at the cap the result lands in `[max * (1 - jitter), max]`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if self.jitter <= 0.0 {
            return raw;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        let jittered = raw.as_secs_f64() * factor;
        Duration::from_secs_f64(jittered.max(0.0)).min(self.max_delay)
    }

    /// Whether the attempt counter has used up the auto-reconnect budget.
    #[must_use]
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
