//! In-process job event bus.
//!
//! [`JobEventBus`] delivers every [`JobEvent`] two ways:
//!
//! - Job-scoped [`JobListener`]s are kept in a per-job registry and are
//!   resolved through their own `oneshot` channel, so an outcome can never
//!   be pushed out by traffic for other jobs.
//! - Unfiltered observers [`subscribe`](JobEventBus::subscribe) to a
//!   `tokio::sync::broadcast` channel and see everything, subject to the
//!   channel's capacity.
//!
//! The bus is designed to be shared via `Arc<JobEventBus>`. Listeners hold
//! only a weak reference: dropping the last `Arc` closes every pending
//! listener.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use jobgate_core::types::{JobId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// Terminal result reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { payload: serde_json::Value },
    Failed { reason: String },
}

/// A terminal event for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    /// When the event was created (UTC).
    pub timestamp: Timestamp,
}

impl JobEvent {
    pub fn completed(job_id: impl Into<JobId>, payload: serde_json::Value) -> Self {
        Self::new(job_id, JobOutcome::Completed { payload })
    }

    pub fn failed(job_id: impl Into<JobId>, reason: impl Into<String>) -> Self {
        Self::new(
            job_id,
            JobOutcome::Failed {
                reason: reason.into(),
            },
        )
    }

    fn new(job_id: impl Into<JobId>, outcome: JobOutcome) -> Self {
        Self {
            job_id: job_id.into(),
            outcome,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Waiter {
    id: u64,
    tx: oneshot::Sender<JobOutcome>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    /// Prepared subscriptions not yet bound to a job, with the first
    /// outcome seen for each job since they were prepared.
    pending: HashMap<u64, HashMap<JobId, JobOutcome>>,
    /// Bound listeners still waiting for their job's outcome.
    waiting: HashMap<JobId, Vec<Waiter>>,
    /// Live listeners per job, settled or not.
    counts: HashMap<JobId, usize>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

// ---------------------------------------------------------------------------
// JobEventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the unfiltered broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus for job outcomes.
pub struct JobEventBus {
    sender: broadcast::Sender<JobEvent>,
    registry: Mutex<Registry>,
}

impl JobEventBus {
    /// Create a bus whose unfiltered channel buffers `capacity` events.
    ///
    /// When that buffer is full, the oldest un-consumed events are dropped
    /// and slow [`subscribe`](Self::subscribe) receivers observe
    /// `RecvError::Lagged`. Job-scoped listeners are not affected.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Publish an event to its job's listeners and to every subscriber.
    ///
    /// Returns how many job-scoped listeners were registered for the
    /// event's job. Zero means nobody is waiting (the waiter may already
    /// have timed out); the event is dropped without error.
    pub fn publish(&self, event: JobEvent) -> usize {
        let waiting = {
            let mut registry = self.registry();
            if let Some(waiters) = registry.waiting.remove(&event.job_id) {
                for waiter in waiters {
                    // A closed receiver belongs to a listener that is being dropped.
                    let _ = waiter.tx.send(event.outcome.clone());
                }
            }
            for buffered in registry.pending.values_mut() {
                buffered
                    .entry(event.job_id.clone())
                    .or_insert_with(|| event.outcome.clone());
            }
            registry.counts.get(&event.job_id).copied().unwrap_or(0)
        };

        if waiting == 0 {
            tracing::debug!(job_id = %event.job_id, "No listeners for job event, dropping");
        }
        // Ignore the SendError; it only means there are zero subscribers.
        let _ = self.sender.send(event);
        waiting
    }

    /// Subscribe to every event on the bus, unfiltered.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Start collecting outcomes now, before the job id is known.
    ///
    /// Prepare before submitting a job and [`bind`](PendingListener::bind)
    /// once the queue returns its id, so an outcome published in between
    /// is not missed.
    pub fn prepare(self: &Arc<Self>) -> PendingListener {
        let mut registry = self.registry();
        let id = registry.next_id();
        registry.pending.insert(id, HashMap::new());
        PendingListener {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Register a listener for `job_id`.
    pub fn listen(self: &Arc<Self>, job_id: impl Into<JobId>) -> JobListener {
        self.prepare().bind(job_id)
    }

    /// Number of live [`JobListener`]s registered for `job_id`.
    pub fn listener_count(&self, job_id: &str) -> usize {
        self.registry().counts.get(job_id).copied().unwrap_or(0)
    }

    /// Number of prepared listeners not yet bound to a job.
    pub fn pending_count(&self) -> usize {
        self.registry().pending.len()
    }

    /// Number of unfiltered broadcast subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// A registration that is collecting outcomes but not yet tied to a job.
///
/// Dropping it unbound discards whatever it collected.
pub struct PendingListener {
    bus: Weak<JobEventBus>,
    id: u64,
}

impl PendingListener {
    /// Scope this registration to `job_id`.
    ///
    /// If `job_id` already reported an outcome since
    /// [`prepare`](JobEventBus::prepare), the listener resolves at once.
    pub fn bind(self, job_id: impl Into<JobId>) -> JobListener {
        let job_id = job_id.into();
        let (tx, rx) = oneshot::channel();

        // With the bus gone, `tx` is dropped here and the listener reports
        // `Closed`.
        if let Some(bus) = self.bus.upgrade() {
            let mut registry = bus.registry();
            let buffered = registry
                .pending
                .remove(&self.id)
                .and_then(|mut outcomes| outcomes.remove(&job_id));
            *registry.counts.entry(job_id.clone()).or_insert(0) += 1;
            match buffered {
                Some(outcome) => {
                    let _ = tx.send(outcome);
                }
                None => registry
                    .waiting
                    .entry(job_id.clone())
                    .or_default()
                    .push(Waiter { id: self.id, tx }),
            }
        }

        JobListener {
            bus: self.bus.clone(),
            job_id,
            id: self.id,
            rx,
        }
    }
}

impl Drop for PendingListener {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.registry().pending.remove(&self.id);
        }
    }
}

/// Why a [`JobListener`] stopped without an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenError {
    /// The bus was dropped; no event can arrive any more.
    Closed,
}

/// A registration of interest in one job's outcome.
///
/// Deregisters itself when dropped, on every exit path.
pub struct JobListener {
    bus: Weak<JobEventBus>,
    job_id: JobId,
    id: u64,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobListener {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait for this job's first outcome.
    ///
    /// The listener is consumed and deregistered once the future finishes
    /// or is dropped.
    pub async fn recv(mut self) -> Result<JobOutcome, ListenError> {
        (&mut self.rx).await.map_err(|_| ListenError::Closed)
    }
}

impl Drop for JobListener {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut registry = bus.registry();
        if let Some(n) = registry.counts.get_mut(&self.job_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                registry.counts.remove(&self.job_id);
            }
        }
        if let Some(waiters) = registry.waiting.get_mut(&self.job_id) {
            waiters.retain(|w| w.id != self.id);
            if waiters.is_empty() {
                registry.waiting.remove(&self.job_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
