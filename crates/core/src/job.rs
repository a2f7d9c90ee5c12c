//! Job records and their lifecycle.
//!
//! A [`JobRecord`] is the single row every job kind shares. All state changes
//! go through the methods here, which consult the transition table in
//! [`crate::state`]; stores persist the result atomically.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::policy::JobPolicy;
use crate::state::Transition;

/// Closed set of job kinds the queue knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Multi-stage resolution of a batch spec into workspaces.
    BatchSpecResolution,
    /// Repository permission synchronisation.
    PermissionsSync,
    /// Precise code-intel indexing of a repository revision.
    CodeIntelIndex,
}

const BATCH_SPEC_STAGES: [JobStage; 7] = [
    JobStage::ResolveWorkspaces,
    JobStage::DetermineRepositories,
    JobStage::FindIgnored,
    JobStage::FindWorkspaces,
    JobStage::BuildWorkspaceCache,
    JobStage::ImportingChangesets,
    JobStage::CreatingWorkspaces,
];

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::BatchSpecResolution,
        JobKind::PermissionsSync,
        JobKind::CodeIntelIndex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::BatchSpecResolution => "batch_spec_resolution",
            JobKind::PermissionsSync => "permissions_sync",
            JobKind::CodeIntelIndex => "codeintel_index",
        }
    }

    /// Ordered stages of this kind; empty for single-step kinds.
    pub fn stages(&self) -> &'static [JobStage] {
        match self {
            JobKind::BatchSpecResolution => &BATCH_SPEC_STAGES,
            JobKind::PermissionsSync | JobKind::CodeIntelIndex => &[],
        }
    }

    pub fn is_staged(&self) -> bool {
        !self.stages().is_empty()
    }

    pub fn first_stage(&self) -> Option<JobStage> {
        self.stages().first().copied()
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job kind: {s}")))
    }
}

/// One step of a multi-stage job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    ResolveWorkspaces,
    DetermineRepositories,
    FindIgnored,
    FindWorkspaces,
    BuildWorkspaceCache,
    ImportingChangesets,
    CreatingWorkspaces,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::ResolveWorkspaces => "resolve_workspaces",
            JobStage::DetermineRepositories => "determine_repositories",
            JobStage::FindIgnored => "find_ignored",
            JobStage::FindWorkspaces => "find_workspaces",
            JobStage::BuildWorkspaceCache => "build_workspace_cache",
            JobStage::ImportingChangesets => "importing_changesets",
            JobStage::CreatingWorkspaces => "creating_workspaces",
        }
    }

    /// The kind this stage belongs to.
    pub fn kind(&self) -> JobKind {
        JobKind::BatchSpecResolution
    }

    /// Zero-based position within the kind's stage order.
    pub fn position(&self) -> usize {
        self.kind()
            .stages()
            .iter()
            .position(|s| s == self)
            .unwrap_or_default()
    }

    pub fn next(&self) -> Option<JobStage> {
        self.kind().stages().get(self.position() + 1).copied()
    }
}

impl core::fmt::Display for JobStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BATCH_SPEC_STAGES
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job stage: {s}")))
    }
}

/// Job record state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be leased.
    Queued,
    /// Leased by exactly one worker.
    Processing,
    /// Finished successfully (terminal).
    Completed,
    /// Handler failed; eligible again once `process_after` passes.
    Errored,
    /// Gave up (terminal).
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Queued,
        JobState::Processing,
        JobState::Completed,
        JobState::Errored,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Errored => "errored",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// States `finished_at` is set in.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Errored | JobState::Failed)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job state: {s}")))
    }
}

/// Opaque reference to kind-specific input (e.g. a batch spec id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(String);

impl PayloadRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One command (or step) recorded by a handler while it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub key: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub output: String,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
}

/// The durable record of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub payload_ref: PayloadRef,
    pub stage: Option<JobStage>,
    /// Completed record of the previous stage this one was created from.
    pub predecessor_id: Option<JobId>,
    pub state: JobState,
    pub failure_message: Option<String>,
    pub process_after: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub num_resets: u32,
    pub num_failures: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub worker_hostname: Option<String>,
    pub execution_logs: Vec<ExecutionLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a queued record.
    ///
    /// Staged kinds may only be created at their first stage (an absent stage
    /// defaults to it); later stages come from [`JobRecord::successor`].
    pub fn new(
        kind: JobKind,
        payload_ref: PayloadRef,
        stage: Option<JobStage>,
        process_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let stage = match (kind.first_stage(), stage) {
            (None, None) => None,
            (None, Some(s)) => {
                return Err(DomainError::stage_order(
                    kind,
                    format!("kind has no stages, got {s}"),
                ));
            }
            (Some(first), None) => Some(first),
            (Some(first), Some(s)) if s == first => Some(s),
            (Some(first), Some(s)) => {
                return Err(DomainError::stage_order(
                    kind,
                    format!("new jobs start at {first}, got {s}; later stages require a completed predecessor"),
                ));
            }
        };

        Ok(Self {
            id: JobId::new(),
            kind,
            payload_ref,
            stage,
            predecessor_id: None,
            state: JobState::Queued,
            failure_message: None,
            process_after,
            started_at: None,
            finished_at: None,
            num_resets: 0,
            num_failures: 0,
            last_heartbeat_at: None,
            worker_hostname: None,
            execution_logs: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Create the record for the stage after `completed`.
    pub fn successor(completed: &CompletedJob, now: DateTime<Utc>) -> DomainResult<Self> {
        let current = completed.stage.ok_or_else(|| {
            DomainError::stage_order(completed.kind, "completed job is not staged")
        })?;
        let next = current.next().ok_or(DomainError::FinalStage(current))?;

        Ok(Self {
            id: JobId::new(),
            kind: completed.kind,
            payload_ref: completed.payload_ref.clone(),
            stage: Some(next),
            predecessor_id: Some(completed.id),
            state: JobState::Queued,
            failure_message: None,
            process_after: None,
            started_at: None,
            finished_at: None,
            num_resets: 0,
            num_failures: 0,
            last_heartbeat_at: None,
            worker_hostname: None,
            execution_logs: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether `dequeue` may select this record at `now`.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        Transition::Lease.allowed_from(self.state) && self.process_after.is_none_or(|at| at <= now)
    }

    /// Whether `worker` currently holds the lease.
    pub fn is_leased_by(&self, worker: &str) -> bool {
        self.state == JobState::Processing && self.worker_hostname.as_deref() == Some(worker)
    }

    /// Whether the lease has gone without a heartbeat for longer than `lease_timeout`.
    pub fn is_stale_at(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        if self.state != JobState::Processing {
            return false;
        }
        match self.last_heartbeat_at.or(self.started_at) {
            Some(seen) => now - seen > lease_timeout,
            None => true,
        }
    }

    pub fn lease(&mut self, worker: &str, now: DateTime<Utc>) -> DomainResult<()> {
        self.state = Transition::Lease.apply(self.state)?;
        self.started_at = Some(now);
        self.finished_at = None;
        self.failure_message = None;
        self.worker_hostname = Some(worker.to_string());
        self.last_heartbeat_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat_at = Some(now);
        self.updated_at = now;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<CompletedJob> {
        self.state = Transition::Complete.apply(self.state)?;
        self.finished_at = Some(now);
        self.failure_message = None;
        self.updated_at = now;
        CompletedJob::from_record(self).ok_or(DomainError::IllegalTransition {
            from: self.state,
            transition: Transition::Complete.name(),
        })
    }

    /// Record a handler failure.
    ///
    /// Retryable failures below the kind's cap move to `Errored` with a backoff;
    /// anything else is terminal. A retryable failure arriving at the cap leaves
    /// `num_failures` at the cap.
    pub fn record_failure(
        &mut self,
        message: impl Into<String>,
        retryable: bool,
        policy: &JobPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<JobState> {
        let message = message.into();

        if retryable && self.num_failures < policy.max_failures {
            self.state = Transition::Retry.apply(self.state)?;
            self.num_failures += 1;
            let delay = policy
                .retry
                .jittered_delay(self.num_failures, self.jitter_seed());
            self.process_after =
                Some(now + Duration::from_std(delay).unwrap_or_else(|_| Duration::zero()));
        } else {
            self.state = Transition::Fail.apply(self.state)?;
            if !retryable {
                self.num_failures = self.num_failures.saturating_add(1);
            }
            self.process_after = None;
        }

        self.failure_message = Some(message);
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(self.state)
    }

    /// Reclaim an abandoned lease, or quarantine the job once `max_resets` is reached.
    pub fn reset(&mut self, max_resets: u32, now: DateTime<Utc>) -> DomainResult<JobState> {
        if self.num_resets >= max_resets {
            self.state = Transition::Fail.apply(self.state)?;
            self.failure_message = Some(format!(
                "job exceeded the maximum of {max_resets} lease resets"
            ));
            self.finished_at = Some(now);
        } else {
            self.state = Transition::Reset.apply(self.state)?;
            self.num_resets += 1;
            self.worker_hostname = None;
            self.finished_at = None;
            self.process_after = None;
        }
        self.updated_at = now;
        Ok(self.state)
    }

    /// Hand a lease back without counting it as a failure or reset.
    pub fn release(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.state = Transition::Release.apply(self.state)?;
        self.worker_hostname = None;
        self.finished_at = None;
        self.process_after = None;
        self.updated_at = now;
        Ok(())
    }

    /// Operator retry of an errored or failed job.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.state = Transition::Requeue.apply(self.state)?;
        self.failure_message = None;
        self.finished_at = None;
        self.process_after = None;
        self.updated_at = now;
        Ok(())
    }

    /// Append an execution log entry, returning its index.
    pub fn append_log(&mut self, entry: ExecutionLogEntry, now: DateTime<Utc>) -> DomainResult<usize> {
        if self.state != JobState::Processing {
            return Err(DomainError::IllegalTransition {
                from: self.state,
                transition: "append_execution_log",
            });
        }
        self.execution_logs.push(entry);
        self.updated_at = now;
        Ok(self.execution_logs.len() - 1)
    }

    /// Per-job jitter seed so retries of different jobs spread out.
    pub fn jitter_seed(&self) -> u64 {
        self.id.as_uuid().as_u64_pair().1
    }
}

/// Proof that a job reached `Completed`.
///
/// Only obtainable from a completed record, which makes "create stage N+1
/// before stage N completed" unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedJob {
    id: JobId,
    kind: JobKind,
    stage: Option<JobStage>,
    payload_ref: PayloadRef,
}

impl CompletedJob {
    pub fn from_record(record: &JobRecord) -> Option<Self> {
        (record.state == JobState::Completed).then(|| Self {
            id: record.id,
            kind: record.kind,
            stage: record.stage,
            payload_ref: record.payload_ref.clone(),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn stage(&self) -> Option<JobStage> {
        self.stage
    }

    pub fn payload_ref(&self) -> &PayloadRef {
        &self.payload_ref
    }

    /// The stage a successor would run, if any.
    pub fn next_stage(&self) -> Option<JobStage> {
        self.stage.and_then(|s| s.next())
    }
}
