//! Retry with exponential backoff and per-call timeouts.

use crate::config::RetryConfig;
use crate::error::{Result, SyncError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Runs `call` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Each attempt is bounded by `timeout`; an elapsed
/// timeout counts as a retryable failure.
pub(crate) async fn with_retry<T, F, Fut>(
    retry: &RetryConfig,
    timeout: Duration,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if attempt > 0 {
            tokio::time::sleep(retry.backoff(attempt)).await;
        }

        let outcome = match tokio::time::timeout(timeout, call()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SyncError::Timeout),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                attempt += 1;
                warn!(operation, attempt, error = %e, "transient failure, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}
