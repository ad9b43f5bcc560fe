//! Bounded retry with exponential backoff and jitter.
//!
//! The attempt closure decides whether a failure is worth retrying; the
//! [`RetryPolicy`] decides how long to wait and when to give up. Waiting goes
//! through a [`Sleeper`] so tests can run the loop without real delays.

use crate::config::LeaseConfig;
use crate::errors::{Result, WardenError};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Outcome of one attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// Finished, stop retrying
    Done(T),
    /// Failed in a way that may succeed later
    Retry(WardenError),
    /// Failed permanently, stop retrying
    Abort(WardenError),
}

/// Retry limits and backoff shape
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Upper bound on the accumulated backoff
    pub max_elapsed: Option<Duration>,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
    /// Fraction of each delay randomized, 0.0 - 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_elapsed: Some(Duration::from_secs(60)),
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy for revoking expired leases
    pub fn for_revocation(config: &LeaseConfig) -> Self {
        Self {
            max_attempts: config.revocation_max_attempts,
            max_elapsed: None,
            base_delay: Duration::from_millis(config.revocation_backoff_base_ms),
            max_delay: Duration::from_millis(config.revocation_backoff_max_ms),
            jitter: config.revocation_jitter,
        }
    }

    /// Delay before attempt `failures + 1`, given `failures` so far and a
    /// jitter sample in `[0, 1)`. Pure so the backoff curve can be tested.
    pub fn delay_for(&self, failures: u32, jitter_sample: f64) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let nominal = self.base_delay.saturating_mul(1u32 << exponent.min(31)).min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let sample = jitter_sample.clamp(0.0, 1.0);
        let factor = 1.0 - jitter + 2.0 * jitter * sample;

        nominal.mul_f64(factor).min(self.max_delay)
    }

    /// Delay before the next attempt using a random jitter sample
    pub fn backoff(&self, failures: u32) -> Duration {
        self.delay_for(failures, rand::random::<f64>())
    }

    /// Whether another attempt is allowed after `failures` failures
    pub fn allows(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

/// Something that can wait
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Run `attempt` until it finishes, aborts, or the policy is exhausted.
///
/// The closure receives the 1-based attempt number. When the policy runs out
/// the last retryable error is returned.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, sleeper: &dyn Sleeper, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut failures = 0u32;
    let mut elapsed = Duration::ZERO;

    loop {
        match attempt(failures + 1).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Abort(error) => return Err(error),
            Attempt::Retry(error) => {
                failures += 1;
                if !policy.allows(failures) {
                    debug!(attempts = failures, error = %error, "Retry policy exhausted");
                    return Err(error);
                }

                let delay = policy.backoff(failures);
                if let Some(max_elapsed) = policy.max_elapsed {
                    if elapsed + delay > max_elapsed {
                        debug!(
                            attempts = failures,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Retry budget exhausted"
                        );
                        return Err(error);
                    }
                }

                debug!(attempt = failures, delay_ms = delay.as_millis() as u64, error = %error, "Retrying");
                sleeper.sleep(delay).await;
                elapsed += delay;
            }
        }
    }
}
