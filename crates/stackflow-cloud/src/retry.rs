//! Retry policy for driver and auth calls

use crate::cancel::CancelToken;
use stackflow_core::DriverError;
use std::future::Future;
use std::time::Duration;

/// Retry configuration for provider operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(retry.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// What a call does, which decides what may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    /// Plan or credential fetch. Any retryable error is retried.
    Query,
    /// Apply or destroy. A call that timed out may have committed remotely,
    /// so only errors the driver reported itself are retried.
    Mutation,
}

/// Why a retried call gave up
#[derive(Debug)]
pub(crate) enum CallError {
    Driver(DriverError),
    Cancelled,
}

/// Run `call` with a per-attempt timeout, retrying retryable errors.
///
/// With a `cancel` token the wait (including backoff sleeps) is abandoned as
/// soon as cancellation is signalled.
pub(crate) async fn call_with_retry<T, F, Fut>(
    operation: &str,
    kind: CallKind,
    retry: &RetryConfig,
    timeout: Duration,
    cancel: Option<&CancelToken>,
    mut call: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    let never = CancelToken::never();
    let cancel = cancel.unwrap_or(&never);
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, call()) => match result {
                Ok(result) => result,
                Err(_) => Err(DriverError::Timeout(format!(
                    "{} timed out after {}s",
                    operation,
                    timeout.as_secs_f64()
                ))),
            },
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
        };

        let timed_out = matches!(result, Err(DriverError::Timeout(_)));
        match result {
            Ok(value) => return Ok(value),
            Err(err) if timed_out && kind == CallKind::Mutation => {
                tracing::warn!(operation, error = %err, "Not retrying a timed-out mutation");
                return Err(CallError::Driver(err));
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = retry.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(CallError::Cancelled),
                }
                attempt += 1;
            }
            Err(err) => return Err(CallError::Driver(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for(3), Duration::from_secs(4));
        assert_eq!(retry.delay_for(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = call_with_retry(
            "auth",
            CallKind::Query,
            &fast(),
            Duration::from_secs(1),
            None,
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(DriverError::Transient("503".to_string()))
                    } else {
                        Ok("token")
                    }
                }
            },
        )
        .await;

        assert!(matches!(result, Ok("token")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = call_with_retry(
            "plan",
            CallKind::Query,
            &fast(),
            Duration::from_secs(1),
            None,
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(DriverError::InvalidConfig("bad".to_string())) }
            },
        )
        .await;

        assert!(matches!(result, Err(CallError::Driver(DriverError::InvalidConfig(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    async fn slow_call(kind: CallKind) -> (Result<(), CallError>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = call_with_retry(
            "slow",
            kind,
            &fast(),
            Duration::from_millis(10),
            None,
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            },
        )
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_query_timeout_is_retried() {
        let (result, calls) = slow_call(CallKind::Query).await;
        assert!(matches!(result, Err(CallError::Driver(DriverError::Timeout(_)))));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_mutation_timeout_runs_once() {
        let (result, calls) = slow_call(CallKind::Mutation).await;
        assert!(matches!(result, Err(CallError::Driver(DriverError::Timeout(_)))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_mutation_retries_reported_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = call_with_retry(
            "apply",
            CallKind::Mutation,
            &fast(),
            Duration::from_secs(1),
            None,
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(DriverError::Transient("throttled".to_string()))
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
