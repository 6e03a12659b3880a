//! Job dispatcher: admit, budget, submit, wait.
//!
//! [`JobDispatcher::admit`] is the fast path a front end calls before
//! acknowledging a request: it rejects duplicates, computes the job's
//! [`TimeoutBudget`], and hands the job to the queue. The returned
//! [`JobTicket`] already holds a listener for the job, subscribed before
//! submission, so an outcome that arrives immediately is not lost.
//! [`JobDispatcher::await_outcome`] then blocks until the outcome or the
//! budget's deadline, measured from submission.

use std::sync::Arc;

use jobgate_core::admission::{AdmissionGuard, DedupStore, Fingerprint, InMemoryDedupStore};
use jobgate_core::budget::{StageCost, TimeoutBudget, TimeoutCalculator};
use jobgate_core::clock::Clock;
use jobgate_core::types::JobId;
use jobgate_events::{wait_on, JobEventBus, JobListener, WaitError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::queue::{JobQueue, JobRequest, QueueError};
use crate::retry::{retry_with_backoff, RetryError};
use crate::sweeper::run_cache_sweeper;

/// An admitted, submitted job that has not been awaited yet.
///
/// Dropping the ticket deregisters its listener.
pub struct JobTicket {
    job_id: JobId,
    fingerprint: Fingerprint,
    budget: TimeoutBudget,
    submitted_at: Instant,
    listener: JobListener,
}

impl JobTicket {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn budget(&self) -> &TimeoutBudget {
        &self.budget
    }
}

/// A dispatcher wired to an in-memory dedup store and its sweeper task.
pub struct InMemoryDispatch {
    pub dispatcher: JobDispatcher,
    pub store: Arc<InMemoryDedupStore>,
    pub sweeper: JoinHandle<()>,
}

/// Composes admission, budgeting, submission and waiting.
pub struct JobDispatcher {
    queue: Arc<dyn JobQueue>,
    guard: AdmissionGuard,
    calculator: TimeoutCalculator,
    bus: Arc<JobEventBus>,
    submit: StageCost,
}

impl JobDispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        guard: AdmissionGuard,
        calculator: TimeoutCalculator,
        bus: Arc<JobEventBus>,
        submit: StageCost,
    ) -> Self {
        Self {
            queue,
            guard,
            calculator,
            bus,
            submit,
        }
    }

    /// Build a dispatcher from validated configuration.
    pub fn from_config(
        config: &DispatchConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn DedupStore>,
        bus: Arc<JobEventBus>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let guard = AdmissionGuard::new(store, config.admission)?;
        let calculator = TimeoutCalculator::new(config.budget)?;
        Ok(Self::new(queue, guard, calculator, bus, config.submit))
    }

    /// Build a dispatcher backed by a process-local dedup store.
    ///
    /// The store holds up to `config.dedup_max_entries` marks, and a
    /// [`run_cache_sweeper`] task purging it every `config.sweep_interval`
    /// is spawned on the current runtime until `cancel` fires.
    pub fn in_memory(
        config: &DispatchConfig,
        queue: Arc<dyn JobQueue>,
        bus: Arc<JobEventBus>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Result<InMemoryDispatch, DispatchError> {
        config.validate()?;
        let store = Arc::new(InMemoryDedupStore::with_capacity(
            config.dedup_max_entries,
            clock,
        )?);
        let dispatcher = Self::from_config(config, queue, store.clone(), bus)?;
        let sweeper = tokio::spawn(run_cache_sweeper(
            Arc::clone(store.cache()),
            config.sweep_interval,
            cancel,
        ));
        Ok(InMemoryDispatch {
            dispatcher,
            store,
            sweeper,
        })
    }

    pub fn calculator(&self) -> &TimeoutCalculator {
        &self.calculator
    }

    /// Admit and submit `request`, returning as soon as the queue accepts it.
    pub async fn admit(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobTicket, DispatchError> {
        let fingerprint = request.fingerprint();
        if self.guard.is_duplicate(&fingerprint).await? {
            return Err(DispatchError::DuplicateRequest { fingerprint });
        }

        let budget = self.calculator.compute_job_timeout(&request.attachments);
        let pending = self.bus.prepare();

        let submitted = retry_with_backoff(
            &self.submit.retry,
            self.submit.per_attempt,
            cancel,
            QueueError::is_retryable,
            |_attempt| self.queue.submit(request, &budget),
        )
        .await;

        let job_id = match submitted {
            Ok(job_id) => job_id,
            Err(e) => {
                self.release(&fingerprint).await;
                return Err(match e {
                    RetryError::Cancelled { .. } => DispatchError::Cancelled { job_id: None },
                    other => {
                        tracing::error!(
                            fingerprint = %fingerprint,
                            error = %other,
                            "Job submission failed",
                        );
                        DispatchError::Submit(other.to_string())
                    }
                });
            }
        };

        tracing::info!(
            job_id = %job_id,
            fingerprint = %fingerprint,
            total_ms = budget.total_ms,
            attachment_stage_ms = budget.attachment_stage_ms,
            clamped = budget.clamped,
            "Job submitted",
        );

        Ok(JobTicket {
            listener: pending.bind(job_id.clone()),
            job_id,
            fingerprint,
            budget,
            submitted_at: Instant::now(),
        })
    }

    /// Wait for the ticket's job until its budget runs out.
    ///
    /// The deadline is measured from submission, not from this call. A
    /// timeout reports `waited_ms` as the time since submission, which is
    /// the job's full budget.
    pub async fn await_outcome(
        &self,
        ticket: JobTicket,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, DispatchError> {
        let remaining = ticket
            .budget
            .total()
            .saturating_sub(ticket.submitted_at.elapsed());
        match wait_on(ticket.listener, remaining, cancel).await {
            Ok(payload) => Ok(payload),
            Err(WaitError::TimedOut { job_id, .. }) => Err(DispatchError::JobTimedOut {
                job_id,
                waited_ms: u64::try_from(ticket.submitted_at.elapsed().as_millis())
                    .unwrap_or(u64::MAX),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Admit, submit and wait in one call.
    pub async fn dispatch(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, DispatchError> {
        let ticket = self.admit(request, cancel).await?;
        self.await_outcome(ticket, cancel).await
    }

    async fn release(&self, fingerprint: &Fingerprint) {
        if let Err(e) = self.guard.release(fingerprint).await {
            tracing::warn!(
                fingerprint = %fingerprint,
                error = %e,
                "Failed to release admission after submit failure",
            );
        }
    }
}
