//! Exponential backoff and bounded local retry.

use std::future::Future;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base =
            self.initial.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let clamped = base.min(self.max.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let jitter_range = clamped * self.jitter;
            let jitter_offset = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
            (clamped + jitter_offset).max(0.0)
        } else {
            clamped
        };

        Duration::from_millis(jittered as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

/// Result of a retried operation, with the number of attempts made.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_retries` retries have been spent.
pub async fn with_retry<F, Fut, T, E>(
    max_retries: u32,
    backoff: &ExponentialBackoff,
    is_retryable: impl Fn(&E) -> bool,
    operation: F,
) -> Result<Retried<T>, Retried<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt + 1,
                });
            }
            Err(e) if attempt < max_retries && is_retryable(&e) => {
                attempt += 1;
                let delay = backoff.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(Retried {
                    value: e,
                    attempts: attempt + 1,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10), 2.0)
                .with_jitter(0.0);

        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_exponential_backoff_max() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(500), 2.0)
                .with_jitter(0.0);

        assert_eq!(backoff.delay_for(10), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = &AtomicU32::new(0);
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), 2.0);

        let result = with_retry(
            3,
            &backoff,
            |_: &String| true,
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("flaky".to_string())
                } else {
                    Ok(7)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.value, 7);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = &AtomicU32::new(0);
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), 2.0);

        let err = with_retry(
            5,
            &backoff,
            |e: &String| e != "fatal",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("fatal".to_string())
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.value, "fatal");
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), 2.0);

        let err = with_retry(
            2,
            &backoff,
            |_: &String| true,
            || async { Err::<(), _>("down".to_string()) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
    }
}
