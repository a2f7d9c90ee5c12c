//! Stage scheduling for the ranking pipeline.
//!
//! Each stage runs on its own cadence with its own number of instances. Stages
//! never talk to each other; they only read and write the shared dataset.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sluice_core::Clock;

use crate::jobs::{JobStore, JobStoreError};

use super::dataset::{DatasetError, RankingDataset};
use super::exporter::Exporter;
use super::janitor::Janitor;
use super::mapper::Mapper;
use super::reducer::Reducer;
use super::source::ArtifactSource;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

/// Work done by one stage run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StageReport {
    pub processed: usize,
    pub skipped: usize,
}

impl StageReport {
    pub fn did_work(&self) -> bool {
        self.processed > 0
    }
}

/// One pipeline stage; each call does a bounded amount of work.
#[async_trait::async_trait]
pub trait StageRoutine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> Result<StageReport, StageError>;
}

/// Ranking pipeline configuration.
#[derive(Debug, Clone)]
pub struct RankingConfig {
    /// Live dataset generation
    pub graph_key: String,
    /// References per export unit
    pub chunk_size: usize,
    pub export_page_size: usize,
    pub map_batch_size: usize,
    /// How long a mapper may hold a unit
    pub claim_ttl: Duration,
    pub reduce_batch_size: usize,
    /// How long finished job records are kept
    pub retention: Duration,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            graph_key: "dev".to_string(),
            chunk_size: 500,
            export_page_size: 100,
            map_batch_size: 16,
            claim_ttl: Duration::from_secs(60),
            reduce_batch_size: 100,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RankingConfig {
    pub fn new(graph_key: impl Into<String>) -> Self {
        Self {
            graph_key: graph_key.into(),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_export_page_size(mut self, size: usize) -> Self {
        self.export_page_size = size;
        self
    }

    pub fn with_map_batch_size(mut self, size: usize) -> Self {
        self.map_batch_size = size;
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn with_reduce_batch_size(mut self, size: usize) -> Self {
        self.reduce_batch_size = size;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Cadence and parallelism of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSchedule {
    pub interval: Duration,
    pub instances: usize,
}

impl StageSchedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            instances: 1,
        }
    }

    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }
}

/// Per-stage counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StageStats {
    pub runs: u64,
    pub failures: u64,
    pub processed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

type SharedStats = Arc<Mutex<BTreeMap<&'static str, StageStats>>>;

/// Runs an ordered list of stages.
pub struct PipelineOrchestrator {
    stages: Vec<(Arc<dyn StageRoutine>, StageSchedule)>,
}

impl PipelineOrchestrator {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn with_stage(mut self, routine: impl StageRoutine + 'static, schedule: StageSchedule) -> Self {
        self.stages.push((Arc::new(routine), schedule));
        self
    }

    /// Stage names in pipeline order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(r, _)| r.name()).collect()
    }

    /// Run every stage once, in order.
    pub async fn run_round(&self) -> Result<Vec<(&'static str, StageReport)>, StageError> {
        let mut reports = Vec::with_capacity(self.stages.len());
        for (routine, _) in &self.stages {
            reports.push((routine.name(), routine.run_once().await?));
        }
        Ok(reports)
    }

    /// Run rounds until one does no work; returns the number of rounds run.
    pub async fn run_until_idle(&self, max_rounds: usize) -> Result<usize, StageError> {
        for round in 1..=max_rounds {
            let reports = self.run_round().await?;
            if reports.iter().all(|(_, r)| !r.did_work()) {
                return Ok(round);
            }
        }
        Ok(max_rounds)
    }

    /// Spawn every stage instance as its own periodic task.
    pub fn spawn(self, shutdown: CancellationToken) -> PipelineHandle {
        let stats: SharedStats = Arc::new(Mutex::new(BTreeMap::new()));
        let mut tasks = Vec::new();

        for (routine, schedule) in self.stages {
            for instance in 0..schedule.instances.max(1) {
                let routine = routine.clone();
                let shutdown = shutdown.clone();
                let stats = stats.clone();
                tasks.push(tokio::spawn(async move {
                    run_periodically(routine, schedule.interval, instance, shutdown, stats).await;
                }));
            }
        }

        PipelineHandle {
            shutdown,
            tasks,
            stats,
        }
    }
}

impl Default for PipelineOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_periodically(
    routine: Arc<dyn StageRoutine>,
    interval: Duration,
    instance: usize,
    shutdown: CancellationToken,
    stats: SharedStats,
) {
    let stage = routine.name();
    info!(stage, instance, interval = ?interval, "pipeline stage started");

    loop {
        let result = tokio::select! {
            () = shutdown.cancelled() => break,
            result = routine.run_once() => result,
        };

        let did_work = {
            let mut stats = stats.lock().unwrap_or_else(|p| p.into_inner());
            let entry = stats.entry(stage).or_default();
            entry.runs += 1;
            entry.last_run_at = Some(Utc::now());
            match &result {
                Ok(report) => {
                    entry.processed += report.processed as u64;
                    report.did_work()
                }
                Err(e) => {
                    entry.failures += 1;
                    entry.last_error = Some(e.to_string());
                    false
                }
            }
        };
        if let Err(e) = result {
            error!(stage, instance, error = %e, "pipeline stage failed");
        }

        // Drain backlogs without waiting; otherwise wait for the next run.
        if !did_work {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    info!(stage, instance, "pipeline stage stopped");
}

/// Handle to the spawned pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: SharedStats,
}

impl PipelineHandle {
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "pipeline stage panicked");
            }
        }
    }

    pub fn stats(&self) -> BTreeMap<&'static str, StageStats> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Cadence of each ranking stage.
#[derive(Debug, Clone, Copy)]
pub struct RankingSchedules {
    pub exporter: StageSchedule,
    pub mapper: StageSchedule,
    pub reducer: StageSchedule,
    pub janitor: StageSchedule,
}

impl Default for RankingSchedules {
    fn default() -> Self {
        Self {
            exporter: StageSchedule::every(Duration::from_secs(30)),
            mapper: StageSchedule::every(Duration::from_secs(5)).with_instances(2),
            reducer: StageSchedule::every(Duration::from_secs(5)),
            janitor: StageSchedule::every(Duration::from_secs(300)),
        }
    }
}

/// Wire the four ranking stages in pipeline order.
pub fn ranking_pipeline(
    config: &RankingConfig,
    schedules: RankingSchedules,
    worker_id: &str,
    source: Arc<dyn ArtifactSource>,
    dataset: Arc<dyn RankingDataset>,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new()
        .with_stage(
            Exporter::new(source, dataset.clone(), clock.clone(), config),
            schedules.exporter,
        )
        .with_stage(
            Mapper::new(dataset.clone(), clock.clone(), format!("{worker_id}/mapper"), config),
            schedules.mapper,
        )
        .with_stage(
            Reducer::new(dataset.clone(), clock.clone(), config),
            schedules.reducer,
        )
        .with_stage(Janitor::new(dataset, jobs, clock, config), schedules.janitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports work a fixed number of times, then idles.
    struct Countdown {
        remaining: AtomicUsize,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl StageRoutine for Countdown {
        fn name(&self) -> &'static str {
            "countdown"
        }

        async fn run_once(&self) -> Result<StageReport, StageError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(StageReport::default());
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            Ok(StageReport {
                processed: 1,
                skipped: 0,
            })
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl StageRoutine for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn run_once(&self) -> Result<StageReport, StageError> {
            Err(DatasetError::Unavailable("down".into()).into())
        }
    }

    fn countdown(n: usize) -> (Countdown, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Countdown {
                remaining: AtomicUsize::new(n),
                runs: runs.clone(),
            },
            runs,
        )
    }

    #[test]
    fn store_errors_keep_their_identity() {
        let id = sluice_core::JobId::new();
        let errors: Vec<StageError> = vec![
            JobStoreError::LeaseLost(id).into(),
            JobStoreError::Unavailable("pool closed".into()).into(),
            DatasetError::Unavailable("pool closed".into()).into(),
        ];

        assert_eq!(errors[0], StageError::Jobs(JobStoreError::LeaseLost(id)));
        assert_ne!(errors[1], errors[2]);
        assert_eq!(errors[1].to_string(), "store unavailable: pool closed");
    }

    #[tokio::test]
    async fn run_until_idle_stops_after_quiet_round() {
        let (stage, runs) = countdown(3);
        let pipeline =
            PipelineOrchestrator::new().with_stage(stage, StageSchedule::every(Duration::from_secs(1)));

        assert_eq!(pipeline.run_until_idle(10).await.unwrap(), 4);
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn spawned_stage_drains_backlog_then_waits() {
        let (stage, runs) = countdown(5);
        let handle = PipelineOrchestrator::new()
            .with_stage(stage, StageSchedule::every(Duration::from_secs(3600)))
            .spawn(CancellationToken::new());

        for _ in 0..100 {
            if runs.load(Ordering::SeqCst) >= 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = handle.stats();
        handle.shutdown().await;

        // Five runs with work plus one idle run, then the long sleep.
        assert_eq!(runs.load(Ordering::SeqCst), 6);
        assert_eq!(stats["countdown"].processed, 5);
    }

    #[tokio::test]
    async fn failures_are_counted_and_retried() {
        let handle = PipelineOrchestrator::new()
            .with_stage(Broken, StageSchedule::every(Duration::from_millis(5)))
            .spawn(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let stats = handle.stats();
        handle.shutdown().await;

        let broken = &stats["broken"];
        assert!(broken.failures >= 2);
        assert_eq!(broken.runs, broken.failures);
        assert!(broken.last_error.as_deref().unwrap().contains("down"));
    }
}
