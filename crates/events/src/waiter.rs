//! Bounded wait for a dispatched job's outcome.
//!
//! Each wait moves `Pending` to exactly one terminal state:
//!
//! | Trigger                     | Terminal state | Result                         |
//! |-----------------------------|----------------|--------------------------------|
//! | completion event for job    | `Completed`    | `Ok(payload)`                  |
//! | failure event for job       | `Failed`       | `Err(WaitError::Failed)`       |
//! | deadline elapses            | `TimedOut`     | `Err(WaitError::TimedOut)`     |
//! | cancellation token fires    | `Cancelled`    | `Err(WaitError::Cancelled)`    |
//! | event bus dropped           | `Closed`       | `Err(WaitError::EventSourceClosed)` |
//!
//! The race is a single `tokio::select!`, so only one branch can win, and
//! the [`JobListener`] is consumed by the wait: it is dropped (and thereby
//! deregistered) before the result is returned, and also if the caller
//! drops the future part-way through.

use std::sync::Arc;
use std::time::Duration;

use jobgate_core::types::JobId;
use tokio_util::sync::CancellationToken;

use crate::bus::{JobEventBus, JobListener, JobOutcome, ListenError};

/// Terminal state of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Closed,
}

impl WaitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Closed => "closed",
        }
    }
}

/// Errors a wait can settle with.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// No outcome arrived before the deadline.
    #[error("Job {job_id} produced no outcome within {waited_ms}ms")]
    TimedOut { job_id: JobId, waited_ms: u64 },

    /// The job reported failure; the reason is passed through untouched.
    #[error("Job {job_id} failed: {reason}")]
    Failed { job_id: JobId, reason: String },

    /// The caller gave up before the job settled.
    #[error("Wait for job {job_id} was cancelled")]
    Cancelled { job_id: JobId },

    /// The event bus went away; no outcome can arrive any more.
    #[error("Event source closed while waiting for job {job_id}")]
    EventSourceClosed { job_id: JobId },
}

impl WaitError {
    pub fn state(&self) -> WaitState {
        match self {
            Self::TimedOut { .. } => WaitState::TimedOut,
            Self::Failed { .. } => WaitState::Failed,
            Self::Cancelled { .. } => WaitState::Cancelled,
            Self::EventSourceClosed { .. } => WaitState::Closed,
        }
    }
}

/// What ended the race in [`wait_on`].
enum Trigger {
    Outcome(JobOutcome),
    Deadline,
    Cancelled,
    Closed,
}

/// Waits for job outcomes published on a shared [`JobEventBus`].
#[derive(Clone)]
pub struct CompletionWaiter {
    bus: Arc<JobEventBus>,
}

impl CompletionWaiter {
    pub fn new(bus: Arc<JobEventBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<JobEventBus> {
        &self.bus
    }

    /// Wait up to `timeout` for `job_id` to complete or fail.
    pub async fn wait(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, WaitError> {
        self.wait_with_cancel(job_id, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`wait`](Self::wait), but also settles as cancelled when
    /// `cancel` fires.
    pub async fn wait_with_cancel(
        &self,
        job_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, WaitError> {
        wait_on(self.bus.listen(job_id), timeout, cancel).await
    }
}

/// Drive an already-registered listener to a terminal state.
///
/// Use this with [`JobEventBus::prepare`] when the listener must exist
/// before the job is submitted.
pub async fn wait_on(
    listener: JobListener,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<serde_json::Value, WaitError> {
    let job_id = listener.job_id().to_string();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    // The listener moves into its branch's future and is dropped with it,
    // whichever branch wins, before `settle` runs.
    let trigger = tokio::select! {
        biased;
        _ = cancel.cancelled() => Trigger::Cancelled,
        received = listener.recv() => match received {
            Ok(outcome) => Trigger::Outcome(outcome),
            Err(ListenError::Closed) => Trigger::Closed,
        },
        _ = &mut deadline => Trigger::Deadline,
    };

    settle(job_id, trigger, timeout)
}

/// The single point where a wait turns into its result.
fn settle(
    job_id: JobId,
    trigger: Trigger,
    timeout: Duration,
) -> Result<serde_json::Value, WaitError> {
    let result = match trigger {
        Trigger::Outcome(JobOutcome::Completed { payload }) => Ok(payload),
        Trigger::Outcome(JobOutcome::Failed { reason }) => Err(WaitError::Failed {
            job_id: job_id.clone(),
            reason,
        }),
        Trigger::Deadline => Err(WaitError::TimedOut {
            job_id: job_id.clone(),
            waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
        Trigger::Cancelled => Err(WaitError::Cancelled {
            job_id: job_id.clone(),
        }),
        Trigger::Closed => Err(WaitError::EventSourceClosed {
            job_id: job_id.clone(),
        }),
    };

    let state = match &result {
        Ok(_) => WaitState::Completed,
        Err(e) => e.state(),
    };
    match state {
        WaitState::Completed | WaitState::Failed => {
            tracing::info!(job_id = %job_id, state = state.as_str(), "Job settled");
        }
        _ => {
            tracing::warn!(
                job_id = %job_id,
                state = state.as_str(),
                "Job wait ended without outcome",
            );
        }
    }

    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
