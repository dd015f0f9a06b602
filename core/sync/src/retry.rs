//! Retry strategy with exponential backoff for transient remote errors.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use ledgersync_common::{Error, Result};

/// How often and how patiently a remote call is retried.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first call. Zero leaves recovery to the next sync pass.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Upper bound for the grown delay, before jitter.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread each delay by +/- 25%.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Pause before retry number `retry` (zero-based).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let grown = self
            .initial_delay
            .mul_f64(self.backoff_multiplier.powi(retry as i32).min(u32::MAX as f64));
        let delay = grown.min(self.max_delay);

        if self.jitter {
            delay.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            delay
        }
    }
}

impl Default for RetryConfig {
    /// A single attempt. Failed records wait for the next synchronization pass.
    fn default() -> Self {
        Self::new(0)
    }
}

/// Runs remote calls, retrying the ones that failed transiently.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails permanently, or the retries run out.
    ///
    /// Only errors for which [`Error::is_transient`] holds are retried; the
    /// last error is returned unchanged.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!("Remote call succeeded on retry {}", retry);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() || retry >= self.config.max_retries {
                if retry > 0 {
                    warn!("Giving up after {} attempts: {}", retry + 1, err);
                }
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(retry);
            retry += 1;
            warn!("Remote call failed ({}), retry {} in {:?}", err, retry, delay);
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_retries: u32) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..RetryConfig::new(max_retries)
        }
    }

    /// Counts calls and fails with `error()` for the first `failures` of them.
    fn flaky(
        calls: Arc<AtomicU32>,
        failures: u32,
        error: fn() -> Error,
    ) -> impl Fn() -> std::future::Ready<Result<u32>> {
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if call < failures { Err(error()) } else { Ok(call) })
        }
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..RetryConfig::new(10)
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(400),
            ..RetryConfig::new(1)
        };
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(299) && delay <= Duration::from_millis(501));
        }
    }

    #[tokio::test]
    async fn test_default_makes_a_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryConfig::default());

        let result = executor
            .execute(flaky(calls.clone(), 1, || Error::Network("offline".to_string())))
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(quick(3));

        let result = executor
            .execute(flaky(calls.clone(), 2, || Error::Network("reset".to_string())))
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_document_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(quick(5));

        let result = executor
            .execute(flaky(calls.clone(), 5, || Error::NotFound("gone".to_string())))
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(quick(2));

        let result = executor
            .execute(flaky(calls.clone(), u32::MAX, || Error::Network("down".to_string())))
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
