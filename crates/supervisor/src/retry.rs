//! Reconnection backoff policy.
//!
//! The base delay for attempt `n` is `base_delay * factor^n`, capped at
//! `max_delay`. Jitter is applied to the capped base and never fed back into
//! later attempts, so delays cannot drift downwards over time.

use std::time::Duration;

use rand::Rng;

/// Lower bound for a jittered delay.
const MIN_JITTERED_DELAY: Duration = Duration::from_millis(10);

/// Backoff and attempt ceiling for one supervisor. Pure and immutable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub factor: f64,
    /// Jitter as a fraction of the delay; `0.2` means ±20%.
    pub jitter: f64,
    /// Maximum number of retries; `0` retries forever.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

impl RetryPolicy {
    /// Constant delay, no jitter, unlimited attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            factor: 1.0,
            jitter: 0.0,
            max_attempts: 0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Un-jittered delay for `attempt` (0-based).
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exp);
        let max_secs = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs > max_secs {
            self.max_delay
        } else if secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
        }
    }

    /// Delay to wait before retry number `attempt` (0-based), with jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let secs = base.as_secs_f64() * (1.0 + spread * offset);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(base)
            .max(MIN_JITTERED_DELAY)
    }

    /// Whether `attempt` retries have used up the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }
}
