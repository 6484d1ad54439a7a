//! Retry with exponential backoff and jitter.
//!
//! Every transient-infra boundary (Hub HTTP, catalog connectivity) funnels
//! through [`retry_async`] so backoff behavior lives in one place.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub base_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying after the given 0-indexed attempt: the base
    /// delay doubled per attempt, jittered by a factor in `[0.5, 1.5)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doubled = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = doubled.min(self.max_delay.as_secs_f64());
        let final_secs = if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            (capped * factor).min(self.max_delay.as_secs_f64())
        } else {
            capped
        };
        Duration::from_secs_f64(final_secs)
    }
}

/// Retry an async operation until it succeeds, the predicate declines, or
/// the attempt budget runs out.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return Ok(value);
            }
            Err(e) => {
                if !should_retry(&e) {
                    debug!("Error is not retryable: {e}");
                    return Err(e);
                }
                if attempt + 1 >= config.max_attempts {
                    warn!(
                        "All {} retry attempts exhausted. Last error: {e}",
                        config.max_attempts
                    );
                    return Err(e);
                }
                let delay = config.delay_for(attempt);
                attempt += 1;
                warn!(
                    "Attempt {attempt}/{} failed: {e}. Retrying in {delay:?}",
                    config.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_doubles_without_jitter() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);
        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            jitter: false,
        };
        assert_eq!(config.delay_for(4), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new().with_base_delay(Duration::from_secs(2));
        for _ in 0..20 {
            let delay = config.delay_for(0);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let config = RetryConfig::new();
        let result =
            retry_async(&config, || async { Ok::<_, String>(42) }, |_: &String| true).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(false);
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_async(
            &config,
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(false);
        let result = retry_async(
            &config,
            || async { Err::<i32, _>("always".to_string()) },
            |_: &String| true,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let config = RetryConfig::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result = retry_async(
            &config,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("permanent".to_string())
                }
            },
            |e: &String| !e.contains("permanent"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
