//! Jobs Module
//!
//! Durable deferred work and the machinery that runs it.
//!
//! - [`model`]: Job records, kinds and outcomes
//! - [`retry`]: What a failed attempt does to a job
//! - [`handler`]: Custom handlers for message jobs
//! - [`executor`]: Acquires due jobs and runs them on worker threads

pub mod executor;
pub mod handler;
pub mod model;
pub mod retry;

pub use executor::{ExecutorSummary, JobExecutor};
pub use handler::{FnJobHandler, JobHandler};
pub use model::{AsyncPhase, Job, JobKind, JobOutcome, JobState, ASYNC_CONTINUATION, TIMER_TRIGGER};
pub use retry::{DecrementRetries, FixedBackoff, RetryPolicy};
