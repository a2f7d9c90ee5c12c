//! Job storage boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use sluice_core::{
    Clock, CompletedJob, DomainError, ExecutionLogEntry, JobId, JobKind, JobPolicies, JobRecord,
    JobStage, JobState, PayloadRef, SystemClock,
};

/// Read-only queries for status display.
///
/// Nothing here changes job state.
#[async_trait::async_trait]
pub trait JobObserver: Send + Sync {
    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// List jobs matching a filter, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Count jobs per state, optionally for one kind.
    async fn stats(&self, kind: Option<JobKind>) -> Result<JobStats, JobStoreError>;
}

/// Job store abstraction.
///
/// The only component allowed to change a job's state. Every mutation is a
/// single-record compare-and-set (completing a stage also inserts its
/// successor in the same step); operations taking a `worker` fail with
/// [`JobStoreError::LeaseLost`] when that worker no longer holds the lease.
#[async_trait::async_trait]
pub trait JobStore: JobObserver {
    /// Insert a new queued job.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError>;

    /// Create the stage after a completed one.
    ///
    /// Idempotent: returns the existing successor if it was already created.
    async fn enqueue_next_stage(&self, completed: &CompletedJob) -> Result<JobId, JobStoreError>;

    /// Lease the oldest eligible job of `kind`; `None` means the queue is empty.
    async fn dequeue(&self, kind: JobKind, worker: &str) -> Result<Option<JobRecord>, JobStoreError>;

    /// Renew the lease.
    async fn heartbeat(&self, id: JobId, worker: &str) -> Result<(), JobStoreError>;

    async fn mark_complete(&self, id: JobId, worker: &str) -> Result<CompletedJob, JobStoreError>;

    /// Complete a staged job and create its successor in one atomic step.
    ///
    /// Either both writes land or neither does, so a failure here leaves the
    /// job processing under the caller's lease. The successor is `None` for
    /// unstaged jobs and final stages.
    async fn mark_complete_and_chain(
        &self,
        id: JobId,
        worker: &str,
    ) -> Result<(CompletedJob, Option<JobId>), JobStoreError>;

    /// Record a handler failure; returns the resulting state (`Errored` or `Failed`).
    async fn mark_errored(
        &self,
        id: JobId,
        worker: &str,
        message: &str,
        retryable: bool,
    ) -> Result<JobState, JobStoreError>;

    /// Append an execution log entry; returns its index.
    async fn append_execution_log(
        &self,
        id: JobId,
        worker: &str,
        entry: ExecutionLogEntry,
    ) -> Result<usize, JobStoreError>;

    /// Hand the lease back without counting a failure or reset.
    async fn release(&self, id: JobId, worker: &str) -> Result<(), JobStoreError>;

    /// Operator retry of an errored or failed job.
    async fn requeue(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Reclaim leases whose last heartbeat is older than `lease_timeout`.
    async fn reclaim_stale(&self, lease_timeout: Duration) -> Result<Vec<ReclaimedJob>, JobStoreError>;

    /// Delete terminal jobs that finished before `cutoff`; returns how many.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Another worker owns the job now (or it is no longer processing).
    #[error("lease lost on job {0}")]
    LeaseLost(JobId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Storage could not be reached; nothing was changed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, JobStoreError::LeaseLost(_))
    }
}

/// Producer-side description of a job to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload_ref: PayloadRef,
    pub stage: Option<JobStage>,
    pub process_after: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(kind: JobKind, payload_ref: impl Into<String>) -> Self {
        Self {
            kind,
            payload_ref: PayloadRef::new(payload_ref),
            stage: None,
            process_after: None,
        }
    }

    pub fn at_stage(mut self, stage: JobStage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Not eligible before `at`.
    pub fn process_after(mut self, at: DateTime<Utc>) -> Self {
        self.process_after = Some(at);
        self
    }

    pub fn into_record(self, now: DateTime<Utc>) -> Result<JobRecord, DomainError> {
        JobRecord::new(self.kind, self.payload_ref, self.stage, self.process_after, now)
    }
}

/// Observer filter.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub state: Option<JobState>,
    pub stage: Option<JobStage>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            kind: None,
            state: None,
            stage: None,
            created_after: None,
            created_before: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn stage(mut self, stage: JobStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        self.kind.is_none_or(|k| job.kind == k)
            && self.state.is_none_or(|s| job.state == s)
            && self.stage.is_none_or(|s| job.stage == Some(s))
            && self.created_after.is_none_or(|at| job.created_at >= at)
            && self.created_before.is_none_or(|at| job.created_at < at)
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub errored: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, state: JobState, count: usize) {
        match state {
            JobState::Queued => self.queued += count,
            JobState::Processing => self.processing += count,
            JobState::Completed => self.completed += count,
            JobState::Errored => self.errored += count,
            JobState::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.errored + self.failed
    }
}

/// Outcome of reclaiming one stale lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedJob {
    pub id: JobId,
    pub kind: JobKind,
    /// `Queued` when requeued, `Failed` when the reset cap was hit.
    pub state: JobState,
    pub num_resets: u32,
}

/// In-memory job store for tests/dev.
///
/// One write lock per operation gives the same per-record atomicity the
/// Postgres store gets from row locks.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    policies: Arc<JobPolicies>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new(policies: JobPolicies) -> Self {
        Self::with_clock(policies, Arc::new(SystemClock))
    }

    pub fn with_clock(policies: JobPolicies, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            policies: Arc::new(policies),
            clock,
        }
    }

    pub fn arc(policies: JobPolicies) -> Arc<Self> {
        Arc::new(Self::new(policies))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    /// Run `f` against a job the worker still owns.
    fn with_owned<T>(
        &self,
        id: JobId,
        worker: &str,
        f: impl FnOnce(&mut JobRecord) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if !job.is_leased_by(worker) {
            return Err(JobStoreError::LeaseLost(id));
        }
        f(job)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(JobPolicies::default())
    }
}

#[async_trait::async_trait]
impl JobObserver for InMemoryJobStore {
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(filter.limit);
        Ok(result)
    }

    async fn stats(&self, kind: Option<JobKind>) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| kind.is_none_or(|k| j.kind == k)) {
            stats.record(job.state, 1);
        }
        Ok(stats)
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let record = job.into_record(self.clock.now())?;
        let id = record.id;
        self.write()?.insert(id, record);
        Ok(id)
    }

    async fn enqueue_next_stage(&self, completed: &CompletedJob) -> Result<JobId, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.write()?;

        match jobs.get(&completed.id()) {
            Some(prev) if prev.state == JobState::Completed => {}
            Some(prev) => {
                return Err(DomainError::stage_order(
                    completed.kind(),
                    format!("predecessor {} is {}", prev.id, prev.state),
                )
                .into());
            }
            None => return Err(JobStoreError::NotFound(completed.id())),
        }

        if let Some(existing) = jobs
            .values()
            .find(|j| j.predecessor_id == Some(completed.id()))
        {
            return Ok(existing.id);
        }

        let record = JobRecord::successor(completed, now)?;
        let id = record.id;
        jobs.insert(id, record);
        Ok(id)
    }

    async fn dequeue(&self, kind: JobKind, worker: &str) -> Result<Option<JobRecord>, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.write()?;

        // Oldest eligible first: by process_after (or creation), then creation order.
        let next = jobs
            .values()
            .filter(|j| j.kind == kind && j.is_eligible_at(now))
            .min_by_key(|j| (j.process_after.unwrap_or(j.created_at), j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.lease(worker, now)?;
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, id: JobId, worker: &str) -> Result<(), JobStoreError> {
        let now = self.clock.now();
        self.with_owned(id, worker, |job| {
            job.heartbeat(now);
            Ok(())
        })
    }

    async fn mark_complete(&self, id: JobId, worker: &str) -> Result<CompletedJob, JobStoreError> {
        let now = self.clock.now();
        self.with_owned(id, worker, |job| Ok(job.complete(now)?))
    }

    async fn mark_complete_and_chain(
        &self,
        id: JobId,
        worker: &str,
    ) -> Result<(CompletedJob, Option<JobId>), JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.write()?;
        let current = jobs.get(&id).ok_or(JobStoreError::NotFound(id))?;
        if !current.is_leased_by(worker) {
            return Err(JobStoreError::LeaseLost(id));
        }

        // Work on a copy so a failed successor leaves the lease untouched.
        let mut job = current.clone();
        let completed = job.complete(now)?;
        let successor = completed
            .next_stage()
            .map(|_| JobRecord::successor(&completed, now))
            .transpose()?;

        jobs.insert(id, job);
        let next = successor.map(|record| {
            let next = record.id;
            jobs.insert(next, record);
            next
        });
        Ok((completed, next))
    }

    async fn mark_errored(
        &self,
        id: JobId,
        worker: &str,
        message: &str,
        retryable: bool,
    ) -> Result<JobState, JobStoreError> {
        let now = self.clock.now();
        self.with_owned(id, worker, |job| {
            let policy = self.policies.for_kind(job.kind);
            Ok(job.record_failure(message, retryable, policy, now)?)
        })
    }

    async fn append_execution_log(
        &self,
        id: JobId,
        worker: &str,
        entry: ExecutionLogEntry,
    ) -> Result<usize, JobStoreError> {
        let now = self.clock.now();
        self.with_owned(id, worker, |job| Ok(job.append_log(entry, now)?))
    }

    async fn release(&self, id: JobId, worker: &str) -> Result<(), JobStoreError> {
        let now = self.clock.now();
        self.with_owned(id, worker, |job| Ok(job.release(now)?))
    }

    async fn requeue(&self, id: JobId) -> Result<(), JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.requeue(now)?;
        Ok(())
    }

    async fn reclaim_stale(&self, lease_timeout: Duration) -> Result<Vec<ReclaimedJob>, JobStoreError> {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(lease_timeout)
            .map_err(|e| JobStoreError::Storage(format!("invalid lease timeout: {e}")))?;

        let mut jobs = self.write()?;
        let mut reclaimed = Vec::new();
        for job in jobs.values_mut().filter(|j| j.is_stale_at(now, timeout)) {
            let max_resets = self.policies.for_kind(job.kind).max_resets;
            let state = job.reset(max_resets, now)?;
            reclaimed.push(ReclaimedJob {
                id: job.id,
                kind: job.kind,
                state,
                num_resets: job.num_resets,
            });
        }
        reclaimed.sort_by_key(|r| r.id);
        Ok(reclaimed)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.state.is_terminal() && j.finished_at.is_some_and(|at| at < cutoff)));
        Ok((before - jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{JobPolicy, ManualClock, RetryPolicy};

    fn store_with_clock(policies: JobPolicies) -> (InMemoryJobStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (InMemoryJobStore::with_clock(policies, clock.clone()), clock)
    }

    fn fast_retry() -> JobPolicies {
        JobPolicies::new(JobPolicy::default().with_retry(RetryPolicy::no_jitter(
            Duration::from_secs(1),
            Duration::from_secs(60),
        )))
    }

    #[tokio::test]
    async fn enqueue_and_dequeue() {
        let (store, _) = store_with_clock(JobPolicies::default());

        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();

        let leased = store
            .dequeue(JobKind::PermissionsSync, "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, id);
        assert_eq!(leased.state, JobState::Processing);
        assert_eq!(leased.worker_hostname.as_deref(), Some("w1"));
        assert!(leased.last_heartbeat_at.is_some());

        // No more jobs
        assert!(store.dequeue(JobKind::PermissionsSync, "w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_respects_kind_and_process_after() {
        let (store, clock) = store_with_clock(JobPolicies::default());
        let later = clock.now() + chrono::Duration::seconds(10);

        store
            .enqueue(NewJob::new(JobKind::CodeIntelIndex, "upload-1").process_after(later))
            .await
            .unwrap();

        assert!(store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap().is_none());
        assert!(store.dequeue(JobKind::CodeIntelIndex, "w1").await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(10));
        assert!(store.dequeue(JobKind::CodeIntelIndex, "w1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let (store, clock) = store_with_clock(JobPolicies::default());
        let first = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "a"))
            .await
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(1));
        let second = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "b"))
            .await
            .unwrap();

        let a = store.dequeue(JobKind::PermissionsSync, "w").await.unwrap().unwrap();
        let b = store.dequeue(JobKind::PermissionsSync, "w").await.unwrap().unwrap();
        assert_eq!((a.id, b.id), (first, second));
    }

    #[tokio::test]
    async fn foreign_worker_cannot_touch_lease() {
        let (store, _) = store_with_clock(JobPolicies::default());
        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();
        store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap();

        assert_eq!(store.heartbeat(id, "w2").await, Err(JobStoreError::LeaseLost(id)));
        assert!(matches!(
            store.mark_complete(id, "w2").await,
            Err(JobStoreError::LeaseLost(_))
        ));
        assert!(matches!(
            store.mark_errored(id, "w2", "nope", true).await,
            Err(JobStoreError::LeaseLost(_))
        ));
        store.heartbeat(id, "w1").await.unwrap();
    }

    #[tokio::test]
    async fn retryable_error_backs_off_then_retries() {
        let (store, clock) = store_with_clock(fast_retry());
        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();
        store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap();

        let state = store.mark_errored(id, "w1", "timeout", true).await.unwrap();
        assert_eq!(state, JobState::Errored);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.num_failures, 1);
        assert_eq!(job.failure_message.as_deref(), Some("timeout"));
        assert_eq!(job.process_after, Some(clock.now() + chrono::Duration::seconds(2)));

        assert!(store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap().is_none());
        clock.advance(chrono::Duration::seconds(2));
        let again = store.dequeue(JobKind::PermissionsSync, "w2").await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert!(again.failure_message.is_none());
        assert!(again.finished_at.is_none());
    }

    #[tokio::test]
    async fn execution_logs_require_ownership() {
        let (store, clock) = store_with_clock(JobPolicies::default());
        let id = store
            .enqueue(NewJob::new(JobKind::CodeIntelIndex, "upload-7"))
            .await
            .unwrap();
        let entry = ExecutionLogEntry {
            key: "index".into(),
            command: "scip-go".into(),
            args: vec![],
            output: "ok".into(),
            exit_code: Some(0),
            started_at: clock.now(),
            duration_ms: Some(12),
        };

        assert!(matches!(
            store.append_execution_log(id, "w1", entry.clone()).await,
            Err(JobStoreError::LeaseLost(_))
        ));

        store.dequeue(JobKind::CodeIntelIndex, "w1").await.unwrap();
        assert_eq!(store.append_execution_log(id, "w1", entry).await.unwrap(), 0);
        store.mark_complete(id, "w1").await.unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.execution_logs.len(), 1);
        assert_eq!(job.execution_logs[0].command, "scip-go");
    }

    #[tokio::test]
    async fn next_stage_requires_completion_and_is_idempotent() {
        let (store, _) = store_with_clock(JobPolicies::default());
        let id = store
            .enqueue(NewJob::new(JobKind::BatchSpecResolution, "spec-1"))
            .await
            .unwrap();

        let err = store
            .enqueue(NewJob::new(JobKind::BatchSpecResolution, "spec-1").at_stage(JobStage::FindIgnored))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Domain(DomainError::StageOrder { .. })));

        store.dequeue(JobKind::BatchSpecResolution, "w1").await.unwrap();
        let proof = store.mark_complete(id, "w1").await.unwrap();

        let next = store.enqueue_next_stage(&proof).await.unwrap();
        assert_eq!(store.enqueue_next_stage(&proof).await.unwrap(), next);

        let next = store.get(next).await.unwrap().unwrap();
        assert_eq!(next.stage, Some(JobStage::DetermineRepositories));
        assert_eq!(next.predecessor_id, Some(id));
    }

    #[tokio::test]
    async fn complete_and_chain_is_one_step() {
        let (store, _) = store_with_clock(JobPolicies::default());
        let id = store
            .enqueue(NewJob::new(JobKind::BatchSpecResolution, "spec-2"))
            .await
            .unwrap();
        store.dequeue(JobKind::BatchSpecResolution, "w1").await.unwrap();

        assert_eq!(
            store.mark_complete_and_chain(id, "w2").await.unwrap_err(),
            JobStoreError::LeaseLost(id)
        );
        assert_eq!(store.stats(None).await.unwrap().total(), 1);

        let (done, next) = store.mark_complete_and_chain(id, "w1").await.unwrap();
        assert_eq!(done.id(), id);
        let next = store.get(next.unwrap()).await.unwrap().unwrap();
        assert_eq!(next.predecessor_id, Some(id));
        assert_eq!(next.state, JobState::Queued);
        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Completed);

        // The final stage and unstaged kinds have no successor.
        let plain = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();
        store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap();
        let (_, next) = store.mark_complete_and_chain(plain, "w1").await.unwrap();
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn requeue_clears_failure() {
        let (store, _) = store_with_clock(JobPolicies::default());
        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();
        store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap();
        store.mark_errored(id, "w1", "fatal", false).await.unwrap();

        store.requeue(id).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.failure_message.is_none());
        assert_eq!(job.num_failures, 1);

        // Queued jobs cannot be requeued again.
        assert!(matches!(store.requeue(id).await, Err(JobStoreError::Domain(_))));
    }

    #[tokio::test]
    async fn release_keeps_counters() {
        let (store, _) = store_with_clock(JobPolicies::default());
        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();
        store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap();
        store.release(id, "w1").await.unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!((job.num_failures, job.num_resets), (0, 0));
        assert!(job.worker_hostname.is_none());
    }

    #[tokio::test]
    async fn reclaim_stale_requeues_then_quarantines() {
        let policies = JobPolicies::default()
            .with_kind(JobKind::PermissionsSync, JobPolicy::default().with_max_resets(1));
        let (store, clock) = store_with_clock(policies);
        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();
        let timeout = Duration::from_secs(30);

        store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap();
        clock.advance(chrono::Duration::seconds(10));
        assert!(store.reclaim_stale(timeout).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(25));
        let reclaimed = store.reclaim_stale(timeout).await.unwrap();
        assert_eq!(
            reclaimed,
            vec![ReclaimedJob {
                id,
                kind: JobKind::PermissionsSync,
                state: JobState::Queued,
                num_resets: 1
            }]
        );
        assert_eq!(store.heartbeat(id, "w1").await, Err(JobStoreError::LeaseLost(id)));

        store.dequeue(JobKind::PermissionsSync, "w2").await.unwrap();
        clock.advance(chrono::Duration::seconds(31));
        let reclaimed = store.reclaim_stale(timeout).await.unwrap();
        assert_eq!(reclaimed[0].state, JobState::Failed);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.num_resets, 1);
    }

    #[tokio::test]
    async fn list_and_stats() {
        let (store, clock) = store_with_clock(JobPolicies::default());
        for i in 0..5 {
            store
                .enqueue(NewJob::new(JobKind::PermissionsSync, format!("repo-{i}")))
                .await
                .unwrap();
            clock.advance(chrono::Duration::milliseconds(1));
        }
        store
            .enqueue(NewJob::new(JobKind::CodeIntelIndex, "upload-1"))
            .await
            .unwrap();

        store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap();
        store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap();

        let stats = store.stats(Some(JobKind::PermissionsSync)).await.unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.processing, 2);
        assert_eq!(store.stats(None).await.unwrap().total(), 6);

        let processing = store
            .list(&JobFilter::default().state(JobState::Processing))
            .await
            .unwrap();
        assert_eq!(processing.len(), 2);

        let limited = store
            .list(&JobFilter::default().kind(JobKind::PermissionsSync).limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].payload_ref.as_str(), "repo-0");
    }

    #[tokio::test]
    async fn delete_terminal_before_cutoff() {
        let (store, clock) = store_with_clock(JobPolicies::default());
        let done = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "old"))
            .await
            .unwrap();
        let open = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "open"))
            .await
            .unwrap();
        store.dequeue(JobKind::PermissionsSync, "w1").await.unwrap();
        store.mark_complete(done, "w1").await.unwrap();

        clock.advance(chrono::Duration::hours(2));
        let cutoff = clock.now() - chrono::Duration::hours(1);
        assert_eq!(store.delete_terminal_before(cutoff).await.unwrap(), 1);
        assert!(store.get(done).await.unwrap().is_none());
        assert!(store.get(open).await.unwrap().is_some());
    }
}
