#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobgate_core::admission::{
    AdmissionConfig, AdmissionGuard, DedupStore, InMemoryDedupStore, StoreFailurePolicy,
};
use jobgate_core::backoff::BackoffPolicy;
use jobgate_core::budget::{
    AttachmentProfile, BudgetConfig, StageCost, TimeoutBudget, TimeoutCalculator,
};
use jobgate_core::clock::ManualClock;
use jobgate_core::error::CoreError;
use jobgate_core::types::JobId;
use jobgate_dispatch::{JobDispatcher, JobQueue, JobRequest, QueueError};
use jobgate_events::{JobEvent, JobEventBus};

/// What the fake queue does with the next submission.
#[derive(Debug, Clone)]
pub enum Step {
    /// Accept, then publish a completion after `after`.
    Complete {
        after: Duration,
        payload: serde_json::Value,
    },
    /// Accept, then publish a failure after `after`.
    Fail { after: Duration, reason: String },
    /// Accept and publish the completion before `submit` returns.
    CompleteInline(serde_json::Value),
    /// Accept and never report an outcome.
    Silent,
    /// Transient error.
    Unavailable,
    /// Permanent error.
    Reject,
}

impl Step {
    pub fn complete(after_ms: u64, payload: serde_json::Value) -> Self {
        Self::Complete {
            after: Duration::from_millis(after_ms),
            payload,
        }
    }

    pub fn fail(after_ms: u64, reason: &str) -> Self {
        Self::Fail {
            after: Duration::from_millis(after_ms),
            reason: reason.to_string(),
        }
    }
}

/// In-process [`JobQueue`] that follows a script, one step per submission.
///
/// Once the script runs out every further submission is [`Step::Silent`].
pub struct ScriptedQueue {
    bus: Arc<JobEventBus>,
    steps: Mutex<VecDeque<Step>>,
    submissions: Mutex<Vec<(JobRequest, TimeoutBudget)>>,
}

impl ScriptedQueue {
    pub fn new(bus: Arc<JobEventBus>, steps: Vec<Step>) -> Self {
        Self {
            bus,
            steps: Mutex::new(steps.into()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    /// Every submission attempt seen so far, including rejected ones.
    pub fn submissions(&self) -> Vec<(JobRequest, TimeoutBudget)> {
        self.submissions.lock().unwrap().clone()
    }

    fn publish_after(&self, after: Duration, event: JobEvent) {
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            bus.publish(event);
        });
    }
}

#[async_trait]
impl JobQueue for ScriptedQueue {
    async fn submit(
        &self,
        request: &JobRequest,
        budget: &TimeoutBudget,
    ) -> Result<JobId, QueueError> {
        self.submissions
            .lock()
            .unwrap()
            .push((request.clone(), *budget));
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Silent);
        let job_id = uuid::Uuid::new_v4().to_string();

        match step {
            Step::Complete { after, payload } => {
                self.publish_after(after, JobEvent::completed(job_id.clone(), payload));
            }
            Step::Fail { after, reason } => {
                self.publish_after(after, JobEvent::failed(job_id.clone(), reason));
            }
            Step::CompleteInline(payload) => {
                self.bus.publish(JobEvent::completed(job_id.clone(), payload));
            }
            Step::Silent => {}
            Step::Unavailable => return Err(QueueError::Unavailable("connection refused".into())),
            Step::Reject => return Err(QueueError::Rejected("payload too large".into())),
        }
        Ok(job_id)
    }
}

/// Dedup store whose backend is always down.
pub struct UnreachableStore;

#[async_trait]
impl DedupStore for UnreachableStore {
    async fn set_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool, CoreError> {
        Err(CoreError::StoreUnavailable("connection reset".into()))
    }

    async fn remove(&self, _key: &str) -> Result<bool, CoreError> {
        Err(CoreError::StoreUnavailable("connection reset".into()))
    }
}

/// Short retry shape so worst cases stay easy to compute: delays 10ms, 20ms.
pub fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(10),
        multiplier: 2.0,
        max_delay: Duration::from_millis(100),
    }
}

/// Budget config with image = 330ms, audio = 630ms, base = 1050ms.
pub fn test_budget_config() -> BudgetConfig {
    BudgetConfig {
        image_stage: StageCost {
            per_attempt: Duration::from_millis(100),
            retry: fast_retry(),
        },
        audio_stage: StageCost {
            per_attempt: Duration::from_millis(200),
            retry: fast_retry(),
        },
        llm_invocation: Duration::from_millis(1000),
        overhead: Duration::from_millis(50),
        platform_ceiling: Duration::from_millis(10_000),
    }
}

pub fn submit_cost() -> StageCost {
    StageCost {
        per_attempt: Duration::from_millis(100),
        retry: fast_retry(),
    }
}

pub fn request(text: &str) -> JobRequest {
    JobRequest {
        caller: "user-1".into(),
        target: "thread-1".into(),
        content: serde_json::json!({ "text": text }),
        attachments: AttachmentProfile::default(),
    }
}

/// Everything a dispatch test needs to drive and inspect one dispatcher.
pub struct Harness {
    pub dispatcher: JobDispatcher,
    pub queue: Arc<ScriptedQueue>,
    pub bus: Arc<JobEventBus>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(steps: Vec<Step>) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let store = InMemoryDedupStore::with_capacity(1000, clock.clone()).unwrap();
    harness_with_store(steps, Arc::new(store), StoreFailurePolicy::FailOpen, clock)
}

pub fn harness_with_store(
    steps: Vec<Step>,
    store: Arc<dyn DedupStore>,
    policy: StoreFailurePolicy,
    clock: Arc<ManualClock>,
) -> Harness {
    let bus = Arc::new(JobEventBus::default());
    let queue = Arc::new(ScriptedQueue::new(Arc::clone(&bus), steps));
    let guard = AdmissionGuard::new(store, AdmissionConfig::new(policy)).unwrap();
    let calculator = TimeoutCalculator::new(test_budget_config()).unwrap();

    let dispatcher = JobDispatcher::new(
        queue.clone(),
        guard,
        calculator,
        Arc::clone(&bus),
        submit_cost(),
    );

    Harness {
        dispatcher,
        queue,
        bus,
        clock,
    }
}
