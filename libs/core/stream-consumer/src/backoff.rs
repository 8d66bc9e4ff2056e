//! Exponential backoff for reconnects and loop error recovery

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Exponential backoff policy
///
/// Delay for attempt `n` (0-based) is `base * multiplier^n`, capped at
/// `max_delay_ms`. With jitter the delay is scaled into 50-100% of that value.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Growth factor between consecutive attempts
    pub multiplier: f64,

    /// Upper bound for a single delay in milliseconds
    pub max_delay_ms: u64,

    /// Randomize delays to spread reconnect storms
    pub jitter: bool,

    /// Retry budget; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
            max_retries: None,
        }
    }
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay_ms: u64) -> Self {
        self.base_delay_ms = delay_ms;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let raw = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let delay = raw as u64;

        let delay = if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        };

        Duration::from_millis(delay)
    }

    /// Whether another retry is allowed after `attempt` failures
    pub fn allows_retry(&self, attempt: u32) -> bool {
        match self.max_retries {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Retry an async operation while `should_retry` accepts the error
///
/// Returns the first success, the first error rejected by `should_retry`,
/// or the last error once the policy's retry budget is spent.
pub async fn retry_when<F, Fut, T, E, P>(
    policy: &BackoffPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempts = attempt, "Operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if !policy.allows_retry(attempt) {
                    warn!(attempts = attempt + 1, error = %e, "Retries exhausted");
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Scale a delay to a pseudo-random 50-100% of its value
fn apply_jitter(delay: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let random_factor =
        (RandomState::new().hash_one(std::time::SystemTime::now()) % 50) as f64 / 100.0 + 0.5;

    (delay as f64 * random_factor) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> BackoffPolicy {
        BackoffPolicy::new()
            .with_base_delay(1)
            .with_max_delay(2)
            .without_jitter()
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = BackoffPolicy::new().without_jitter();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full() {
        let policy = BackoffPolicy::new().with_base_delay(1000);

        for _ in 0..20 {
            let delay = policy.delay_for_attempt(0).as_millis();
            assert!((500..=1000).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_retry_budget() {
        let bounded = BackoffPolicy::new().with_max_retries(2);
        assert!(bounded.allows_retry(0));
        assert!(bounded.allows_retry(1));
        assert!(!bounded.allows_retry(2));

        let unbounded = BackoffPolicy::new();
        assert!(unbounded.allows_retry(u32::MAX - 1));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let counter = Arc::new(AtomicU32::new(0));

        let result = retry_when(
            &fast(),
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet")
                    } else {
                        Ok("done")
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let counter = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = retry_when(
            &fast().with_max_retries(2),
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("down")
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Err("down"));
        // first attempt + 2 retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_when_stops_on_rejected_error() {
        let counter = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = retry_when(
            &fast(),
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("WRONGTYPE")
                }
            },
            |e: &&str| e.contains("connection"),
        )
        .await;

        assert_eq!(result, Err("WRONGTYPE"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
