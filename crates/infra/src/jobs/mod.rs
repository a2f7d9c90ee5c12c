//! Durable job queue: storage, worker loops and lease reclamation.
//!
//! ## Components
//!
//! - `JobStore`: the only writer of job state (in-memory or Postgres)
//! - `JobWorker`: polling loops that lease jobs and run registered handlers
//! - `Reaper`: returns leases whose heartbeats stopped to the queue
//! - `CommandHandler`: runs an external command and records it in the job's log

pub mod command;
pub mod executor;
pub mod handler;
pub mod postgres;
pub mod reaper;
pub mod store;

pub use command::{CommandHandler, CommandSpec};
pub use executor::{
    JobOutcome, JobWorker, JobWorkerHandle, WorkerConfig, WorkerConfigError, WorkerStats,
};
pub use handler::{
    ExecutionLogSink, FnHandler, HandlerError, HandlerRegistry, JobContext, JobHandler, handler_fn,
};
pub use postgres::PostgresJobStore;
pub use reaper::{Reaper, ReaperConfig};
pub use store::{
    InMemoryJobStore, JobFilter, JobObserver, JobStats, JobStore, JobStoreError, NewJob,
    ReclaimedJob,
};
