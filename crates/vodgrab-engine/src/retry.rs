// Chunk Retry: fixed-delay retry loop around a single chunk fetch.
//
// Transient failures are retried up to the policy limit, permanent ones end the
// loop at once. Cancellation interrupts both attempts and delays.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::DownloadError;

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure (network, non-403 status, I/O)
    Retry(DownloadError),
    /// Permanent failure, no further attempts
    Fail(DownloadError),
}

impl<T> From<Result<T, DownloadError>> for RetryAction<T> {
    fn from(result: Result<T, DownloadError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retry(err),
            Err(err) => Self::Fail(err),
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently or runs out of
/// retries. The closure receives the 0-based attempt number.
///
/// Exhaustion is reported as `RetriesExhausted` carrying the last cause.
pub async fn retry_fixed<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    index: u64,
    url: &str,
    operation: F,
) -> Result<T, DownloadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(DownloadError::Aborted);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };

        if attempt >= policy.max_retries {
            return Err(DownloadError::RetriesExhausted {
                index,
                url: url.to_string(),
                attempts: attempt + 1,
                source: Box::new(err),
            });
        }

        attempt += 1;
        warn!(
            chunk = index,
            url,
            attempt,
            max = policy.max_retries,
            delay_ms = policy.delay.as_millis() as u64,
            error = %err,
            "Chunk failed, retrying"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Aborted),
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}
