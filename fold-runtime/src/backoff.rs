//! Retry delays for dialing the worker socket.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`, then
//! spread by a symmetric jitter of `±jitter × delay`.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Fraction of the delay to randomize by, in `0.0..=1.0`.
    pub jitter: f64,
}

/// Dial policy for the ingress client: 500µs growing by 1.1×, 20% jitter, 4s cap.
pub const DIAL_BACKOFF: BackoffPolicy = BackoffPolicy {
    first: Duration::from_micros(500),
    max: Duration::from_secs(4),
    factor: 1.1,
    jitter: 0.2,
};

impl Default for BackoffPolicy {
    fn default() -> Self {
        DIAL_BACKOFF
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-based), without jitter.
    pub fn base(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let clamped_exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped_secs = self.first.as_secs_f64() * self.factor.powi(clamped_exp);

        if !unclamped_secs.is_finite() || unclamped_secs < 0.0 || unclamped_secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped_secs)
        }
    }

    pub fn next(&self, attempt: u32) -> Duration {
        apply_jitter(self.base(attempt), self.jitter)
    }
}

fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    let micros = delay.as_micros() as u64;
    let spread = (micros as f64 * fraction) as u64;
    if spread == 0 {
        return delay;
    }
    let mut rng = rand::rng();
    let low = micros.saturating_sub(spread);
    let high = micros.saturating_add(spread);
    Duration::from_micros(rng.random_range(low..=high))
}
