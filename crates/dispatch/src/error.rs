use jobgate_core::admission::Fingerprint;
use jobgate_core::error::CoreError;
use jobgate_core::types::JobId;
use jobgate_events::WaitError;

/// Everything a dispatch can end with, other than the job's payload.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The same request was admitted within the dedup window.
    #[error("Duplicate request {fingerprint} is already in flight")]
    DuplicateRequest { fingerprint: Fingerprint },

    /// Invalid retry, budget or admission parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The dedup store could not be reached and the guard fails closed.
    #[error("Dedup store unavailable: {0}")]
    StoreUnavailable(String),

    /// The queue refused the job or stayed unreachable through every retry.
    #[error("Job submission failed: {0}")]
    Submit(String),

    #[error("Job {job_id} timed out after {waited_ms}ms")]
    JobTimedOut { job_id: JobId, waited_ms: u64 },

    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: JobId, reason: String },

    /// The caller abandoned the request. `job_id` is `None` when this
    /// happened before the queue accepted the job.
    #[error("Dispatch cancelled{}", cancelled_job(.job_id))]
    Cancelled { job_id: Option<JobId> },

    #[error("Event source closed while waiting for job {job_id}")]
    EventSourceClosed { job_id: JobId },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Whether resubmitting the same request later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DuplicateRequest { .. }
                | Self::StoreUnavailable(_)
                | Self::Submit(_)
                | Self::JobTimedOut { .. }
        )
    }
}

fn cancelled_job(job_id: &Option<JobId>) -> String {
    job_id
        .as_deref()
        .map(|id| format!(" while waiting for job {id}"))
        .unwrap_or_default()
}

impl From<CoreError> for DispatchError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) | CoreError::Configuration(msg) => Self::Configuration(msg),
            CoreError::StoreUnavailable(msg) => Self::StoreUnavailable(msg),
            CoreError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl From<WaitError> for DispatchError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::TimedOut { job_id, waited_ms } => Self::JobTimedOut { job_id, waited_ms },
            WaitError::Failed { job_id, reason } => Self::JobFailed { job_id, reason },
            WaitError::Cancelled { job_id } => Self::Cancelled {
                job_id: Some(job_id),
            },
            WaitError::EventSourceClosed { job_id } => Self::EventSourceClosed { job_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn timeout_and_failure_stay_distinct() {
        let timed_out: DispatchError = WaitError::TimedOut {
            job_id: "j".into(),
            waited_ms: 10,
        }
        .into();
        let failed: DispatchError = WaitError::Failed {
            job_id: "j".into(),
            reason: "boom".into(),
        }
        .into();

        assert_matches!(timed_out, DispatchError::JobTimedOut { waited_ms: 10, .. });
        assert_matches!(failed, DispatchError::JobFailed { ref reason, .. } if reason == "boom");
        assert!(timed_out.is_retryable());
        assert!(!failed.is_retryable());
    }

    #[test]
    fn cancelled_message_names_the_job_when_known() {
        let waiting: DispatchError = WaitError::Cancelled {
            job_id: "job-3".into(),
        }
        .into();
        assert_eq!(
            waiting.to_string(),
            "Dispatch cancelled while waiting for job job-3"
        );
        assert_eq!(
            DispatchError::Cancelled { job_id: None }.to_string(),
            "Dispatch cancelled"
        );
    }

    #[test]
    fn core_errors_map_onto_dispatch_taxonomy() {
        assert_matches!(
            DispatchError::from(CoreError::Configuration("bad".into())),
            DispatchError::Configuration(_)
        );
        assert_matches!(
            DispatchError::from(CoreError::StoreUnavailable("down".into())),
            DispatchError::StoreUnavailable(_)
        );
    }
}
