//! Job outcome events and the completion waiter.
//!
//! - [`JobEventBus`] is the in-process publish/subscribe hub for
//!   [`JobEvent`]s: a per-job registry for listeners, and a
//!   `tokio::sync::broadcast` channel for unfiltered subscribers.
//! - [`JobListener`] is a job-scoped registration on the bus that
//!   deregisters itself on drop.
//! - [`CompletionWaiter`] turns a listener into a bounded, cancellable
//!   wait for one job's outcome.

pub mod bus;
pub mod waiter;

pub use bus::{JobEvent, JobEventBus, JobListener, JobOutcome, PendingListener};
pub use waiter::{wait_on, CompletionWaiter, WaitError, WaitState};
