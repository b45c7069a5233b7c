// Shared retry-with-backoff logic for transfers and uploads.
//
// Callers classify each attempt's outcome through `RetryAction`; the driver
// only decides whether another attempt happens and how long to wait first.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::TransferError;

// Doubling stops well before u64 millisecond arithmetic could wrap.
const MAX_DOUBLINGS: u32 = 20;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay between retries, doubled on every subsequent attempt.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, adds random jitter of up to half the base delay to spread
    /// retries from concurrent jobs.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy for a single HTTP open: 5 retries, 200 ms doubling to a 5 s cap.
    pub fn http_open() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }

    /// Policy for a whole-file copy attempt: 5 attempts with backoff.
    pub fn whole_copy() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }

    /// Fixed-interval policy: `retries` attempts spaced `interval` apart.
    /// Setting base == max pins the exponential schedule to the interval.
    pub fn fixed(retries: u32, interval: Duration) -> Self {
        Self {
            max_retries: retries,
            base_delay: interval,
            max_delay: interval,
            jitter: false,
        }
    }

    /// Backoff before retry number `attempt` (0-indexed). All arithmetic is
    /// done in whole milliseconds; the result never exceeds `max_delay`.
    fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let cap_ms = self.max_delay.as_millis() as u64;

        let doubled = base_ms.saturating_mul(1u64 << attempt.min(MAX_DOUBLINGS));
        let mut delay_ms = doubled.min(cap_ms);

        if self.jitter && base_ms >= 2 {
            delay_ms = delay_ms.saturating_add(rand::rng().random_range(0..base_ms / 2));
            delay_ms = delay_ms.min(cap_ms);
        }

        Duration::from_millis(delay_ms)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    Success(T),
    /// Failed with a retryable error (network, 5xx, timeout).
    Retry(TransferError),
    /// Failed with a permanent error (4xx, not-found, validation).
    Fail(TransferError),
}

impl<T> RetryAction<T> {
    /// Classify an error by its own retryability predicate.
    pub fn from_error(err: TransferError) -> Self {
        if err.is_retryable() {
            Self::Retry(err)
        } else {
            Self::Fail(err)
        }
    }
}

/// Drive an async operation through a retry policy.
///
/// The closure receives the current attempt number (0-indexed). Success and
/// permanent failure end the loop at once; a retryable failure sleeps out
/// the backoff and goes again until the policy's attempts are spent.
/// Cancellation wins over both the next attempt and any backoff sleep.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, TransferError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };

        if attempt >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.backoff(attempt);
        warn!(
            attempt = attempt + 1,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Classify a reqwest error as retryable or non-retryable. Redirect-policy
/// and builder failures are the only ones another attempt cannot change.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    !(e.is_redirect() || e.is_builder())
}
