//! `sluice-core`: job model building blocks.
//!
//! This crate contains the **pure** job model (no storage or runtime concerns):
//! identifiers, the job record and its state machine, and retry policies.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod policy;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ExportUnitId, JobId};
pub use job::{
    CompletedJob, ExecutionLogEntry, JobKind, JobRecord, JobStage, JobState, PayloadRef,
};
pub use policy::{BackoffStrategy, ErrorPolicy, JobPolicies, JobPolicy, RetryPolicy};
pub use state::Transition;
