//! Dispatch composition: admission guard, timeout budget, queue submission
//! and the bounded wait for a job's outcome.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod queue;
pub mod retry;
pub mod sweeper;

pub use config::DispatchConfig;
pub use dispatcher::{InMemoryDispatch, JobDispatcher, JobTicket};
pub use error::DispatchError;
pub use queue::{JobQueue, JobRequest, QueueError};
