//! Submission seam to the external job queue.

use async_trait::async_trait;
use jobgate_core::admission::Fingerprint;
use jobgate_core::budget::{AttachmentProfile, TimeoutBudget};
use jobgate_core::types::JobId;
use serde::{Deserialize, Serialize};

/// A generation request as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Who sent the request.
    pub caller: String,
    /// Where the reply should go (conversation, channel, etc.).
    pub target: String,
    /// Request body forwarded to the worker untouched.
    pub content: serde_json::Value,
    #[serde(default)]
    pub attachments: AttachmentProfile,
}

impl JobRequest {
    /// Identity key used by the admission guard.
    ///
    /// `serde_json` keeps object keys sorted, so logically equal bodies
    /// hash the same.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::derive(&self.caller, &self.target, self.content.to_string().as_bytes())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Transient failure reaching the queue.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// The queue refused this job; resubmitting it unchanged will not help.
    #[error("Job rejected by queue: {0}")]
    Rejected(String),
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable, at-least-once job queue.
///
/// The queue must honour `budget.total_ms` as the job's runtime limit and
/// publish exactly one terminal event per outcome for the returned id.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn submit(&self, request: &JobRequest, budget: &TimeoutBudget)
        -> Result<JobId, QueueError>;
}
