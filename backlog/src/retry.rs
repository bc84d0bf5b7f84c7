use chrono::{DateTime, Utc};
use std::time::Duration;
use typed_builder::TypedBuilder;

/// Decides whether a failed job is retried and how long it waits before the next attempt.
///
/// The default backoff is exponential, `base * 2^(attempts - 1)`, capped at `max_delay`.
///
///    ```rust
///         let policy = RetryPolicy::builder()
///             .max_attempts(3_u32)
///             .base(Duration::from_millis(100))
///             .max_delay(Duration::from_secs(1))
///             .build();
///     ```
///
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one. Must be at least 1
    #[builder(default = 3)]
    pub max_attempts: u32,
    /// Delay before the first retry
    #[builder(default = Duration::from_secs(1))]
    pub base: Duration,
    /// Upper bound of any computed delay
    #[builder(default = Duration::from_secs(60))]
    pub max_delay: Duration,
    /// Fraction of the delay, in `[0, 1]`, by which the delay is perturbed.
    /// The perturbation depends only on the attempt number
    #[builder(default = 0.0)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::builder().build()
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay to wait after the `attempts`-th failed attempt.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let delay = 2u32
            .checked_pow(attempts - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay));

        if self.jitter <= 0.0 {
            return delay;
        }

        // pseudo-random in [-1, 1), fixed per attempt number
        let spread = ((attempts as f64 * 17.0) % 100.0) / 50.0 - 1.0;
        let jittered = delay.as_secs_f64() * (1.0 + self.jitter.min(1.0) * spread);

        Duration::try_from_secs_f64(jittered.max(0.0))
            .map_or(self.max_delay, |jittered| jittered.min(self.max_delay))
    }

    /// Instant at which a job that failed its `attempts`-th attempt at `now` becomes available again.
    pub fn retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff(attempts))
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));

        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
