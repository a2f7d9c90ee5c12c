//! Worker loops: lease, run, heartbeat, report.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sluice_core::{JobId, JobKind, JobPolicies, JobRecord, JobState};

use super::handler::{ExecutionLogSink, HandlerError, HandlerRegistry, JobContext};
use super::store::{JobStore, JobStoreError};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity recorded as the leaseholder; each loop appends its own suffix.
    pub worker_id: String,
    /// Idle wait when the queue is empty
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// A lease without a heartbeat for this long is reclaimed
    pub lease_timeout: Duration,
    pub reaper_interval: Duration,
    /// Loops per kind unless overridden
    pub default_concurrency: usize,
    pub concurrency: HashMap<JobKind, usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "sluice-worker".to_string(),
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            lease_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(10),
            default_concurrency: 1,
            concurrency: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, kind: JobKind, loops: usize) -> Self {
        self.concurrency.insert(kind, loops);
        self
    }

    pub fn concurrency_for(&self, kind: JobKind) -> usize {
        self.concurrency
            .get(&kind)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    /// Reject timing combinations under which live leases would be reclaimed.
    pub fn validate(&self) -> Result<(), WorkerConfigError> {
        if self.heartbeat_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(WorkerConfigError::ZeroInterval);
        }
        if self.heartbeat_interval >= self.lease_timeout {
            return Err(WorkerConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                lease_timeout: self.lease_timeout,
            });
        }
        if self.reaper_interval.is_zero() || self.reaper_interval >= self.lease_timeout {
            return Err(WorkerConfigError::ReaperTooSlow {
                reaper: self.reaper_interval,
                lease_timeout: self.lease_timeout,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerConfigError {
    #[error("poll and heartbeat intervals must be non-zero")]
    ZeroInterval,
    #[error("heartbeat interval {heartbeat:?} must be shorter than the lease timeout {lease_timeout:?}")]
    HeartbeatTooSlow {
        heartbeat: Duration,
        lease_timeout: Duration,
    },
    #[error("reaper interval {reaper:?} must be non-zero and shorter than the lease timeout {lease_timeout:?}")]
    ReaperTooSlow {
        reaper: Duration,
        lease_timeout: Duration,
    },
}

/// What happened to one leased job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { next_stage: Option<JobId> },
    /// Retryable failure; eligible again after backoff.
    Errored,
    Failed,
    /// Another worker owns the job now; nothing was reported.
    LeaseLost,
    /// Handed back at shutdown.
    Released,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_errored: u64,
    pub jobs_failed: u64,
    pub leases_lost: u64,
    pub jobs_released: u64,
    /// Jobs leased and not yet reported
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Completed { .. } => self.jobs_succeeded += 1,
            JobOutcome::Errored => self.jobs_errored += 1,
            JobOutcome::Failed => self.jobs_failed += 1,
            JobOutcome::LeaseLost => self.leases_lost += 1,
            JobOutcome::Released => self.jobs_released += 1,
        }
    }
}

/// Handle to control running worker loops.
#[derive(Debug)]
pub struct JobWorkerHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl JobWorkerHandle {
    /// Stop polling, release in-flight jobs and wait for every loop to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker loop panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock_stats(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Number of polling loops running.
    pub fn loops(&self) -> usize {
        self.tasks.len()
    }
}

/// Runs registered handlers against jobs leased from a [`JobStore`].
#[derive(Clone)]
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    policies: Arc<JobPolicies>,
}

impl JobWorker {
    pub fn new(store: Arc<dyn JobStore>, registry: HandlerRegistry, policies: JobPolicies) -> Self {
        Self {
            store,
            registry,
            policies: Arc::new(policies),
        }
    }

    /// Spawn polling loops for every registered kind.
    ///
    /// Each loop leases under its own identity (`<worker_id>/<kind>/<n>`), so
    /// two loops of one process never share a lease.
    pub fn spawn(self, config: WorkerConfig, shutdown: CancellationToken) -> JobWorkerHandle {
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let mut tasks = Vec::new();

        for kind in self.registry.kinds() {
            for n in 0..config.concurrency_for(kind).max(1) {
                let worker = format!("{}/{}/{}", config.worker_id, kind, n);
                let this = self.clone();
                let config = config.clone();
                let shutdown = shutdown.clone();
                let stats = stats.clone();
                tasks.push(tokio::spawn(async move {
                    this.poll_loop(kind, worker, config, shutdown, stats).await;
                }));
            }
        }

        JobWorkerHandle {
            shutdown,
            tasks,
            stats,
            started: Instant::now(),
        }
    }

    async fn poll_loop(
        &self,
        kind: JobKind,
        worker: String,
        config: WorkerConfig,
        shutdown: CancellationToken,
        stats: Arc<Mutex<WorkerStats>>,
    ) {
        info!(worker = %worker, kind = %kind, "worker loop started");

        while !shutdown.is_cancelled() {
            let job = match self.lease(kind, &worker).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    idle(&shutdown, config.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    error!(worker = %worker, kind = %kind, error = %e, "dequeue failed");
                    idle(&shutdown, config.poll_interval).await;
                    continue;
                }
            };

            lock_stats(&stats).current_running += 1;
            let result = self.process(job, &worker, &config, &shutdown).await;

            let failed = {
                let mut current = lock_stats(&stats);
                current.current_running -= 1;
                match result {
                    Ok(outcome) => {
                        current.record(&outcome);
                        None
                    }
                    Err(e) => Some(e),
                }
            };
            if let Some(e) = failed {
                error!(worker = %worker, kind = %kind, error = %e, "failed to report job outcome");
                idle(&shutdown, config.poll_interval).await;
            }
        }

        info!(worker = %worker, kind = %kind, "worker loop stopped");
    }

    /// Lease and process at most one job; `None` means the queue was empty.
    pub async fn run_once(
        &self,
        kind: JobKind,
        worker: &str,
        config: &WorkerConfig,
        shutdown: &CancellationToken,
    ) -> Result<Option<JobOutcome>, JobStoreError> {
        let Some(job) = self.lease(kind, worker).await? else {
            return Ok(None);
        };
        self.process(job, worker, config, shutdown).await.map(Some)
    }

    async fn lease(&self, kind: JobKind, worker: &str) -> Result<Option<JobRecord>, JobStoreError> {
        let job = self.store.dequeue(kind, worker).await?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, kind = %job.kind, stage = ?job.stage, worker = %worker, "leased job");
        }
        Ok(job)
    }

    async fn process(
        &self,
        job: JobRecord,
        worker: &str,
        config: &WorkerConfig,
        shutdown: &CancellationToken,
    ) -> Result<JobOutcome, JobStoreError> {
        let Some(handler) = self.registry.get(job.kind) else {
            warn!(job_id = %job.id, kind = %job.kind, "no handler for job");
            let message = format!("no handler registered for job kind {}", job.kind);
            return self.report_failure(&job, worker, HandlerError::fatal(message)).await;
        };

        let job_cancel = shutdown.child_token();
        let ctx = JobContext::new(
            job_cancel.clone(),
            ExecutionLogSink::new(self.store.clone(), job.id, worker),
        );

        // A panicking handler must only fail its own job, never the loop.
        let mut task = {
            let job = job.clone();
            tokio::spawn(async move { handler.handle(&job, &ctx).await })
        };

        let result = tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) => Err(join_failure(e)),
            },
            () = heartbeat_until_lost(self.store.as_ref(), job.id, worker, config.heartbeat_interval) => {
                job_cancel.cancel();
                task.abort();
                warn!(job_id = %job.id, worker = %worker, "lease lost, abandoning job");
                return Ok(JobOutcome::LeaseLost);
            }
            () = shutdown.cancelled() => {
                job_cancel.cancel();
                task.abort();
                return self.release(&job, worker).await;
            }
        };

        match result {
            Ok(()) => self.report_success(&job, worker).await,
            Err(e) => self.report_failure(&job, worker, e).await,
        }
    }

    async fn report_success(&self, job: &JobRecord, worker: &str) -> Result<JobOutcome, JobStoreError> {
        // Completion and the successor insert land together or not at all; on
        // error the job stays leased and the reaper hands it out again.
        let completed = if self.policies.for_kind(job.kind).chain_stages {
            self.store.mark_complete_and_chain(job.id, worker).await
        } else {
            self.store.mark_complete(job.id, worker).await.map(|c| (c, None))
        };
        let (_, next_stage) = match completed {
            Ok(c) => c,
            Err(JobStoreError::LeaseLost(_)) => return Ok(JobOutcome::LeaseLost),
            Err(e) => return Err(e),
        };

        info!(job_id = %job.id, kind = %job.kind, stage = ?job.stage, "job completed");
        if let Some(next) = next_stage {
            debug!(job_id = %job.id, next_id = %next, "enqueued next stage");
        }
        Ok(JobOutcome::Completed { next_stage })
    }

    async fn report_failure(
        &self,
        job: &JobRecord,
        worker: &str,
        err: HandlerError,
    ) -> Result<JobOutcome, JobStoreError> {
        let retryable = self
            .policies
            .for_kind(job.kind)
            .errors
            .is_retryable(err.is_retryable());

        match self
            .store
            .mark_errored(job.id, worker, err.message(), retryable)
            .await
        {
            Ok(JobState::Errored) => {
                warn!(job_id = %job.id, kind = %job.kind, error = %err, "job errored, will retry");
                Ok(JobOutcome::Errored)
            }
            Ok(state) => {
                warn!(job_id = %job.id, kind = %job.kind, error = %err, state = %state, "job failed");
                Ok(JobOutcome::Failed)
            }
            Err(JobStoreError::LeaseLost(_)) => Ok(JobOutcome::LeaseLost),
            Err(e) => Err(e),
        }
    }

    async fn release(&self, job: &JobRecord, worker: &str) -> Result<JobOutcome, JobStoreError> {
        match self.store.release(job.id, worker).await {
            Ok(()) => {
                info!(job_id = %job.id, worker = %worker, "released job on shutdown");
                Ok(JobOutcome::Released)
            }
            Err(JobStoreError::LeaseLost(_)) => Ok(JobOutcome::LeaseLost),
            Err(e) => Err(e),
        }
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|p| p.into_inner())
}

fn join_failure(err: JoinError) -> HandlerError {
    if !err.is_panic() {
        return HandlerError::retryable(format!("handler task ended early: {err}"));
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    HandlerError::fatal(format!("handler panicked: {detail}"))
}

/// Renew the lease every `interval`; returns only once the lease is lost.
async fn heartbeat_until_lost(store: &dyn JobStore, id: JobId, worker: &str, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the lease was stamped at dequeue.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match store.heartbeat(id, worker).await {
            Ok(()) => {}
            Err(JobStoreError::LeaseLost(_)) | Err(JobStoreError::NotFound(_)) => return,
            Err(e) => warn!(job_id = %id, worker = %worker, error = %e, "heartbeat failed"),
        }
    }
}

async fn idle(shutdown: &CancellationToken, wait: Duration) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        () = tokio::time::sleep(wait) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler::handler_fn;
    use crate::jobs::store::{
        InMemoryJobStore, JobFilter, JobObserver, JobStats, NewJob, ReclaimedJob,
    };
    use chrono::{DateTime, Utc};
    use sluice_core::{
        CompletedJob, ExecutionLogEntry, JobPolicy, JobStage, ManualClock, RetryPolicy,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    fn policies() -> JobPolicies {
        JobPolicies::new(JobPolicy::default().with_retry(RetryPolicy::no_jitter(
            Duration::from_secs(1),
            Duration::from_secs(10),
        )))
    }

    fn setup(registry: HandlerRegistry) -> (Arc<InMemoryJobStore>, JobWorker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(policies(), clock.clone()));
        let worker = JobWorker::new(store.clone(), registry, policies());
        (store, worker, clock)
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn config_validation() {
        assert!(WorkerConfig::default().validate().is_ok());

        let slow = WorkerConfig::default().with_heartbeat_interval(Duration::from_secs(30));
        assert!(matches!(
            slow.validate(),
            Err(WorkerConfigError::HeartbeatTooSlow { .. })
        ));

        let reaper = WorkerConfig::default().with_reaper_interval(Duration::from_secs(60));
        assert!(matches!(
            reaper.validate(),
            Err(WorkerConfigError::ReaperTooSlow { .. })
        ));
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let registry = HandlerRegistry::new().with(
            JobKind::PermissionsSync,
            handler_fn(|_job, _ctx| async { Ok(()) }),
        );
        let (store, worker, _) = setup(registry);
        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();

        let outcome = worker
            .run_once(JobKind::PermissionsSync, "w1", &config(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed { next_stage: None }));
        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Completed);

        let empty = worker
            .run_once(JobKind::PermissionsSync, "w1", &config(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(empty, None);
    }

    #[tokio::test]
    async fn handler_errors_are_classified() {
        let registry = HandlerRegistry::new()
            .with(
                JobKind::PermissionsSync,
                handler_fn(|_job, _ctx| async { Err(HandlerError::retryable("rate limited")) }),
            )
            .with(
                JobKind::CodeIntelIndex,
                handler_fn(|_job, _ctx| async { Err(HandlerError::fatal("corrupt upload")) }),
            );
        let (store, worker, _) = setup(registry);
        let retry = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();
        let fatal = store
            .enqueue(NewJob::new(JobKind::CodeIntelIndex, "upload-1"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let outcome = worker
            .run_once(JobKind::PermissionsSync, "w1", &config(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, Some(JobOutcome::Errored));

        let outcome = worker
            .run_once(JobKind::CodeIntelIndex, "w1", &config(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, Some(JobOutcome::Failed));

        let retry = store.get(retry).await.unwrap().unwrap();
        assert_eq!(retry.state, JobState::Errored);
        assert_eq!(retry.failure_message.as_deref(), Some("rate limited"));

        let fatal = store.get(fatal).await.unwrap().unwrap();
        assert_eq!(fatal.state, JobState::Failed);
        assert_eq!(fatal.num_failures, 1);
    }

    #[tokio::test]
    async fn missing_handler_fails_job() {
        let registry = HandlerRegistry::new();
        let (store, worker, _) = setup(registry);
        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();

        let outcome = worker
            .run_once(JobKind::PermissionsSync, "w1", &config(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Some(JobOutcome::Failed));
        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.failure_message.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn completed_stage_chains_next() {
        let registry = HandlerRegistry::new().with(
            JobKind::BatchSpecResolution,
            handler_fn(|_job, _ctx| async { Ok(()) }),
        );
        let (store, worker, _) = setup(registry);
        let first = store
            .enqueue(NewJob::new(JobKind::BatchSpecResolution, "spec-9"))
            .await
            .unwrap();

        let outcome = worker
            .run_once(JobKind::BatchSpecResolution, "w1", &config(), &CancellationToken::new())
            .await
            .unwrap();
        let Some(JobOutcome::Completed { next_stage: Some(next) }) = outcome else {
            panic!("expected a chained stage, got {outcome:?}");
        };

        let next = store.get(next).await.unwrap().unwrap();
        assert_eq!(next.predecessor_id, Some(first));
        assert_eq!(next.stage, Some(JobStage::DetermineRepositories));
        assert_eq!(next.payload_ref.as_str(), "spec-9");
    }

    #[tokio::test]
    async fn handler_logs_reach_the_record() {
        let registry = HandlerRegistry::new().with(
            JobKind::CodeIntelIndex,
            handler_fn(|_job, ctx: JobContext| async move {
                let entry = ExecutionLogEntry {
                    key: "step.0".into(),
                    command: "indexer".into(),
                    args: vec!["--out".into(), "index.scip".into()],
                    output: "done".into(),
                    exit_code: Some(0),
                    started_at: chrono::Utc::now(),
                    duration_ms: Some(3),
                };
                ctx.logs()
                    .record(entry)
                    .await
                    .map_err(|e| HandlerError::retryable(e.to_string()))?;
                Ok(())
            }),
        );
        let (store, worker, _) = setup(registry);
        let id = store
            .enqueue(NewJob::new(JobKind::CodeIntelIndex, "upload-3"))
            .await
            .unwrap();

        worker
            .run_once(JobKind::CodeIntelIndex, "w1", &config(), &CancellationToken::new())
            .await
            .unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.execution_logs.len(), 1);
        assert_eq!(job.execution_logs[0].args, vec!["--out", "index.scip"]);
    }

    #[tokio::test]
    async fn lost_lease_abandons_handler() {
        let registry = HandlerRegistry::new().with(
            JobKind::PermissionsSync,
            handler_fn(|_job, ctx: JobContext| async move {
                ctx.cancellation().cancelled().await;
                Ok(())
            }),
        );
        let (store, worker, clock) = setup(registry);
        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();

        let reclaimer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                clock.advance(chrono::Duration::minutes(5));
                store.reclaim_stale(Duration::from_secs(30)).await.unwrap();
            })
        };

        let outcome = worker
            .run_once(JobKind::PermissionsSync, "w1", &config(), &CancellationToken::new())
            .await
            .unwrap();
        reclaimer.await.unwrap();

        assert_eq!(outcome, Some(JobOutcome::LeaseLost));
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.num_resets, 1);
        assert_eq!(job.num_failures, 0);
    }

    #[tokio::test]
    async fn shutdown_releases_in_flight_job() {
        let registry = HandlerRegistry::new().with(
            JobKind::PermissionsSync,
            handler_fn(|_job, _ctx| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }),
        );
        let (store, worker, _) = setup(registry);
        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();

        let handle = worker.spawn(config(), CancellationToken::new());
        assert_eq!(handle.loops(), 1);

        // Wait until the job is picked up.
        for _ in 0..100 {
            if store.get(id).await.unwrap().unwrap().state == JobState::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats_before = handle.stats();
        handle.shutdown().await;
        assert_eq!(stats_before.jobs_processed, 0);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!((job.num_failures, job.num_resets), (0, 0));
    }

    #[tokio::test]
    async fn spawned_loops_drain_the_queue() {
        let registry = HandlerRegistry::new().with(
            JobKind::PermissionsSync,
            handler_fn(|_job, _ctx| async { Ok(()) }),
        );
        let (store, worker, _) = setup(registry);
        for i in 0..10 {
            store
                .enqueue(NewJob::new(JobKind::PermissionsSync, format!("repo-{i}")))
                .await
                .unwrap();
        }

        let handle = worker.spawn(
            config().with_concurrency(JobKind::PermissionsSync, 3),
            CancellationToken::new(),
        );
        assert_eq!(handle.loops(), 3);

        for _ in 0..200 {
            if store.stats(None).await.unwrap().completed == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = handle.stats();
        handle.shutdown().await;
        assert_eq!(stats.jobs_succeeded, 10);
        assert_eq!(store.stats(None).await.unwrap().completed, 10);
    }

    /// Delegates to an in-memory store but fails the first stage completion.
    struct FailFirstCompletion {
        inner: Arc<InMemoryJobStore>,
        failed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl JobObserver for FailFirstCompletion {
        async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
            self.inner.get(id).await
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.list(filter).await
        }

        async fn stats(&self, kind: Option<JobKind>) -> Result<JobStats, JobStoreError> {
            self.inner.stats(kind).await
        }
    }

    #[async_trait::async_trait]
    impl JobStore for FailFirstCompletion {
        async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
            self.inner.enqueue(job).await
        }

        async fn enqueue_next_stage(&self, completed: &CompletedJob) -> Result<JobId, JobStoreError> {
            self.inner.enqueue_next_stage(completed).await
        }

        async fn dequeue(&self, kind: JobKind, worker: &str) -> Result<Option<JobRecord>, JobStoreError> {
            self.inner.dequeue(kind, worker).await
        }

        async fn heartbeat(&self, id: JobId, worker: &str) -> Result<(), JobStoreError> {
            self.inner.heartbeat(id, worker).await
        }

        async fn mark_complete(&self, id: JobId, worker: &str) -> Result<CompletedJob, JobStoreError> {
            self.inner.mark_complete(id, worker).await
        }

        async fn mark_complete_and_chain(
            &self,
            id: JobId,
            worker: &str,
        ) -> Result<(CompletedJob, Option<JobId>), JobStoreError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(JobStoreError::Unavailable("connection reset".into()));
            }
            self.inner.mark_complete_and_chain(id, worker).await
        }

        async fn mark_errored(
            &self,
            id: JobId,
            worker: &str,
            message: &str,
            retryable: bool,
        ) -> Result<JobState, JobStoreError> {
            self.inner.mark_errored(id, worker, message, retryable).await
        }

        async fn append_execution_log(
            &self,
            id: JobId,
            worker: &str,
            entry: ExecutionLogEntry,
        ) -> Result<usize, JobStoreError> {
            self.inner.append_execution_log(id, worker, entry).await
        }

        async fn release(&self, id: JobId, worker: &str) -> Result<(), JobStoreError> {
            self.inner.release(id, worker).await
        }

        async fn requeue(&self, id: JobId) -> Result<(), JobStoreError> {
            self.inner.requeue(id).await
        }

        async fn reclaim_stale(&self, lease_timeout: Duration) -> Result<Vec<ReclaimedJob>, JobStoreError> {
            self.inner.reclaim_stale(lease_timeout).await
        }

        async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
            self.inner.delete_terminal_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn failed_stage_completion_is_retried_and_chains() {
        let clock = Arc::new(ManualClock::starting_now());
        let inner = Arc::new(InMemoryJobStore::with_clock(policies(), clock.clone()));
        let store = Arc::new(FailFirstCompletion {
            inner: inner.clone(),
            failed: AtomicBool::new(false),
        });
        let registry = HandlerRegistry::new().with(
            JobKind::BatchSpecResolution,
            handler_fn(|_job, _ctx| async { Ok(()) }),
        );
        let worker = JobWorker::new(store, registry, policies());
        let first = inner
            .enqueue(NewJob::new(JobKind::BatchSpecResolution, "spec-4"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let err = worker
            .run_once(JobKind::BatchSpecResolution, "w1", &config(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, JobStoreError::Unavailable("connection reset".into()));

        // Nothing was half-written: still leased, no successor.
        let job = inner.get(first).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(inner.stats(None).await.unwrap().total(), 1);

        clock.advance(chrono::Duration::minutes(5));
        let reclaimed = inner.reclaim_stale(Duration::from_secs(30)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        let outcome = worker
            .run_once(JobKind::BatchSpecResolution, "w2", &config(), &cancel)
            .await
            .unwrap();
        let Some(JobOutcome::Completed { next_stage: Some(next) }) = outcome else {
            panic!("expected a chained stage, got {outcome:?}");
        };
        let next = inner.get(next).await.unwrap().unwrap();
        assert_eq!(next.predecessor_id, Some(first));
        assert_eq!(next.stage, Some(JobStage::DetermineRepositories));

        let job = inner.get(first).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!((job.num_resets, job.num_failures), (1, 0));
    }

    #[tokio::test]
    async fn panicking_handler_fails_only_its_job() {
        let registry = HandlerRegistry::new().with(
            JobKind::PermissionsSync,
            handler_fn(|job: JobRecord, _ctx| async move {
                if job.payload_ref.as_str() == "boom" {
                    panic!("malformed payload");
                }
                Ok(())
            }),
        );
        let (store, worker, _) = setup(registry);
        let boom = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "boom"))
            .await
            .unwrap();
        let good = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "good"))
            .await
            .unwrap();

        let handle = worker.spawn(config(), CancellationToken::new());
        for _ in 0..200 {
            let stats = store.stats(None).await.unwrap();
            if stats.completed + stats.failed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(store.get(good).await.unwrap().unwrap().state, JobState::Completed);
        let boom = store.get(boom).await.unwrap().unwrap();
        assert_eq!(boom.state, JobState::Failed);
        assert_eq!(
            boom.failure_message.as_deref(),
            Some("handler panicked: malformed payload")
        );
        assert_eq!((stats.jobs_succeeded, stats.jobs_failed), (1, 1));
    }

    #[tokio::test]
    async fn running_count_tracks_in_flight_jobs() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let registry = HandlerRegistry::new().with(JobKind::PermissionsSync, {
            let gate = gate.clone();
            handler_fn(move |_job, _ctx| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            })
        });
        let (store, worker, _) = setup(registry);
        let id = store
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo-1"))
            .await
            .unwrap();

        let handle = worker.spawn(config(), CancellationToken::new());
        for _ in 0..200 {
            if handle.stats().current_running == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().current_running, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Processing);

        gate.notify_one();
        for _ in 0..200 {
            if handle.stats().jobs_succeeded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = handle.stats();
        handle.shutdown().await;
        assert_eq!((stats.jobs_succeeded, stats.current_running), (1, 0));
    }
}
