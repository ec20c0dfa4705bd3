//! Exponential backoff with jitter.
//!
//! All retrying pipelines (graph requests, uploads, hydration retries,
//! realtime reconnects) share this policy: delay after the n-th
//! consecutive failure is `initial * 2^min(n-1, max_exponent)`,
//! jittered by a symmetric factor and capped at `max`.

use std::time::Duration;

use rand::Rng;

/// Default initial delay (1 s).
pub const DEFAULT_INITIAL: Duration = Duration::from_secs(1);

/// Default delay cap (60 s).
pub const DEFAULT_MAX: Duration = Duration::from_secs(60);

/// Default exponent clamp: growth stops at `2^10`.
pub const DEFAULT_MAX_EXPONENT: u32 = 10;

/// Backoff policy plus the failure counter it drives.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    /// Symmetric jitter fraction in `[0, 1)`; 0.1 means ±10%.
    jitter: f64,
    max_exponent: u32,
    failures: u32,
}

impl Backoff {
    /// Create a backoff with the given initial delay and cap, ±50%
    /// jitter and the default exponent clamp.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: 0.5,
            max_exponent: DEFAULT_MAX_EXPONENT,
            failures: 0,
        }
    }

    /// The shared network retry policy: 1 s → 60 s.
    #[must_use]
    pub fn network() -> Self {
        Self::new(DEFAULT_INITIAL, DEFAULT_MAX)
    }

    /// Override the jitter fraction.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// Override the exponent clamp.
    #[must_use]
    pub fn with_max_exponent(mut self, max_exponent: u32) -> Self {
        self.max_exponent = max_exponent;
        self
    }

    /// Number of consecutive failures recorded so far.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return the delay to sleep before the next
    /// attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures)
    }

    /// Reset the failure counter after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delay for the n-th consecutive failure (n >= 1), jittered.
    #[must_use]
    pub fn delay_for(&self, failure: u32) -> Duration {
        let (lo, hi) = self.bounds_for(failure);
        if lo >= hi {
            return lo;
        }
        let range = (hi - lo).as_secs_f64();
        let offset = rand::thread_rng().gen::<f64>() * range;
        lo + Duration::from_secs_f64(offset)
    }

    /// The `[min, max]` delay window for the n-th failure, before the
    /// random draw. Exposed so tests can assert the envelope without
    /// fighting the RNG.
    #[must_use]
    pub fn bounds_for(&self, failure: u32) -> (Duration, Duration) {
        let exponent = failure.saturating_sub(1).min(self.max_exponent);
        let base = self.initial.as_secs_f64() * 2f64.powi(exponent as i32);
        let lo = (base * (1.0 - self.jitter)).max(0.0);
        let hi = base * (1.0 + self.jitter);
        let cap = self.max.as_secs_f64();
        (
            Duration::from_secs_f64(lo.min(cap)),
            Duration::from_secs_f64(hi.min(cap)),
        )
    }
}
