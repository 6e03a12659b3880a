//! Bounded retry loop driven by a [`BackoffPolicy`].
//!
//! Each attempt runs under its own timeout; between attempts the loop
//! sleeps for the policy's delay. Cancellation is honoured both while an
//! attempt is in flight and while sleeping. The loop always terminates
//! within [`BackoffPolicy::total_elapsed`] of the per-attempt timeout.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use jobgate_core::backoff::BackoffPolicy;
use tokio_util::sync::CancellationToken;

/// Why a single attempt did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum AttemptFailure<E> {
    #[error("attempt timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(E),
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last failure.
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: AttemptFailure<E>,
    },

    /// An attempt failed in a way the caller marked as not retryable.
    #[error("Attempt {attempt} failed permanently: {error}")]
    Aborted { attempt: u32, error: E },

    #[error("Retry cancelled during attempt {attempt}")]
    Cancelled { attempt: u32 },
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// `op` receives the 1-based attempt number. `is_retryable` decides
/// whether an error is worth another attempt; timeouts always are.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &BackoffPolicy,
    per_attempt: Duration,
    cancel: &CancellationToken,
    is_retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempt }),
            outcome = tokio::time::timeout(per_attempt, op(attempt)) => outcome,
        };

        let failure = match outcome {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(error)) if !is_retryable(&error) => {
                return Err(RetryError::Aborted { attempt, error });
            }
            Ok(Err(error)) => AttemptFailure::Failed(error),
            Err(_elapsed) => AttemptFailure::TimedOut(per_attempt),
        };

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: failure,
            });
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Attempt {attempt} failed, retrying",
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempt }),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
