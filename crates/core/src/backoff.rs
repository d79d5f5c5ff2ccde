//! Capped exponential backoff.
//!
//! One policy type drives every retry loop in the system: worker
//! reconnection, waiting for a backend's output file, and verifying an
//! uploaded artifact on the broker. A fixed interval is just a
//! multiplier of `1.0`.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Tunable parameters for a retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Total attempts allowed, `None` for unbounded.
    pub max_attempts: Option<u32>,
    /// Stop starting new attempts once this much time has passed.
    pub max_elapsed: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
            max_elapsed: None,
        }
    }
}

impl Backoff {
    /// Growing delays: `initial`, `initial * multiplier`, ... capped at `max`.
    pub fn exponential(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            ..Self::default()
        }
    }

    /// Constant delay between attempts.
    pub fn fixed(interval: Duration) -> Self {
        Self::exponential(interval, 1.0, interval)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_elapsed(mut self, elapsed: Duration) -> Self {
        self.max_elapsed = Some(elapsed);
        self
    }

    /// Calculate the delay following `current`, clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempt/elapsed budget runs out.
    ///
    /// `op` receives the 1-based attempt number. The last error is
    /// returned when the budget is exhausted.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut delay = self.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let out_of_attempts = self.max_attempts.is_some_and(|max| attempt >= max);
            let out_of_time = self
                .max_elapsed
                .is_some_and(|max| started.elapsed() + delay > max);
            if out_of_attempts || out_of_time {
                return Err(err);
            }

            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );
            tokio::time::sleep(delay).await;
            delay = self.next_delay(delay);
        }
    }
}
