//! Bounded retry with exponential backoff and jitter for provider calls.
//!
//! Only [`FleetError::ProviderUnavailable`] is retried. Structural errors
//! (bad taints, identity still in use, unschedulable workloads) are returned
//! on the first attempt so the step fails fast and its dependents are skipped.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use fleet_common::FleetError;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first; at least one is always made.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Same attempt budget with millisecond delays, for tests and dry runs.
    pub fn fast(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Run `operation` until it succeeds, fails non-transiently, or the attempt
/// budget is spent. The last error is returned unchanged.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, FleetError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, FleetError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "provider call failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis() as u64,
                    "provider call failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_immediately() {
        let result = retry_transient(&RetryConfig::fast(3), "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn absorbs_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result = retry_transient(&RetryConfig::fast(4), "op", move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FleetError::unavailable("throttled"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), _> = retry_transient(&RetryConfig::fast(3), "op", move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(FleetError::unavailable("down"))
            }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn structural_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), _> = retry_transient(&RetryConfig::fast(5), "op", move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(FleetError::invalid_taints("duplicate key"))
            }
        })
        .await;
        assert!(matches!(result, Err(FleetError::InvalidTaintSet(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let result = retry_transient(&RetryConfig::fast(0), "op", || async { Ok(1) }).await;
        assert_eq!(result, Ok(1));
    }
}
