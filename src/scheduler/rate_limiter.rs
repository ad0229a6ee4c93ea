//! Bounded concurrency gate over provider calls.
//!
//! Every provider call across every worker goes through one [`RateLimiter`].
//! A released permit is held back for a random jitter before the next waiter
//! gets it, which spreads out bursts against the shared upstream.

use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Exponential backoff for transient provider errors.
///
/// Delay for retry `n` (1-indexed) is `base_delay * multiplier^(n-1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// No waiting between retries. Useful in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_retries,
        }
    }

    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Shared provider-call gate. Cheap to clone; clones share permits.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    jitter: RangeInclusive<Duration>,
    backoff: BackoffPolicy,
}

/// A held provider slot. Hand it back with [`RatePermit::release`] to apply
/// the jitter; dropping it returns the slot immediately.
#[derive(Debug)]
pub struct RatePermit {
    permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
    jitter: Duration,
}

impl RatePermit {
    pub fn release(mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if self.jitter.is_zero() {
            drop(permit);
            return;
        }
        let hold = self.jitter;
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            drop(permit);
        });
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RateLimiter {
    pub fn new(
        max_concurrent: usize,
        jitter: RangeInclusive<Duration>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            jitter,
            backoff,
        }
    }

    /// Suspends until a slot is free.
    pub async fn acquire(&self) -> Result<RatePermit, ProviderError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("rate limiter closed: {}", e)))?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(RatePermit {
            permit: Some(permit),
            in_flight: Arc::clone(&self.in_flight),
            jitter: self.sample_jitter(),
        })
    }

    /// Runs `op` under a permit, retrying `Busy` responses with backoff.
    ///
    /// The permit is released between retries so a busy upstream does not
    /// starve the other workers. Only the final result is returned.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut retries = 0u32;
        loop {
            let permit = self.acquire().await?;
            let result = op().await;
            permit.release();

            match result {
                Err(err) if err.is_transient() && retries < self.backoff.max_retries => {
                    retries += 1;
                    let delay = self.backoff.next_delay(retries);
                    warn!(
                        retry = retries,
                        max_retries = self.backoff.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Provider busy, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => {
                    if retries > 0 {
                        debug!(retries, "Provider call settled after busy retries");
                    }
                    return other;
                }
            }
        }
    }

    /// Provider calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Slots free right now (jitter holds count as taken).
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn sample_jitter(&self) -> Duration {
        let (min, max) = (*self.jitter.start(), *self.jitter.end());
        if max <= min {
            return min;
        }
        let micros = rand::rng().random_range(min.as_micros() as u64..=max.as_micros() as u64);
        Duration::from_micros(micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn no_jitter(limit: usize) -> RateLimiter {
        RateLimiter::new(limit, Duration::ZERO..=Duration::ZERO, BackoffPolicy::immediate(3))
    }

    #[test]
    fn test_backoff_delays() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_retries: 5,
        };
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
        assert_eq!(policy.next_delay(200), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_permits_bound_in_flight() {
        let limiter = no_jitter(2);
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 2);
        assert_eq!(limiter.available_permits(), 0);

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        a.release();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_jitter_holds_released_permit() {
        let fixed = Duration::from_millis(50);
        let limiter = RateLimiter::new(1, fixed..=fixed, BackoffPolicy::immediate(0));

        let permit = limiter.acquire().await.unwrap();
        permit.release();
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.available_permits(), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_call_retries_busy_then_succeeds() {
        let limiter = no_jitter(1);
        let calls = AtomicU32::new(0);

        let result = limiter
            .call(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::Busy("overloaded".to_string()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_call_gives_up_after_max_retries() {
        let limiter = no_jitter(1);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = limiter
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Busy("still busy".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Busy(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_call_does_not_retry_permanent_errors() {
        let limiter = no_jitter(1);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = limiter
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Unavailable("bad key".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
