//! Process wiring: stores, worker loops, reaper and ranking pipeline.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sluice_core::{Clock, SystemClock};
use sluice_infra::jobs::{
    HandlerRegistry, InMemoryJobStore, JobStore, JobWorker, JobWorkerHandle, PostgresJobStore,
    Reaper, ReaperConfig,
};
use sluice_infra::ranking::{
    ArtifactSource, InMemoryArtifactSource, InMemoryRankingDataset, PipelineHandle,
    PostgresArtifactSource, PostgresRankingDataset, RankingDataset, RankingSchedules,
    ranking_pipeline,
};
use sluice_infra::schema::ensure_schema;

use crate::config::Settings;

/// Storage backends shared by every component of the process.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub dataset: Arc<dyn RankingDataset>,
    pub source: Arc<dyn ArtifactSource>,
}

impl Stores {
    pub fn in_memory(settings: &Settings, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::with_clock(settings.policies.clone(), clock)),
            dataset: InMemoryRankingDataset::arc(),
            source: Arc::new(InMemoryArtifactSource::new()),
        }
    }

    pub async fn connect(settings: &Settings, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let Some(url) = settings.database_url.as_deref() else {
            warn!("DATABASE_URL not set; using in-memory stores");
            return Ok(Self::in_memory(settings, clock));
        };

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(url)
            .await
            .context("failed to connect to Postgres")?;
        ensure_schema(&pool)
            .await
            .context("failed to apply database schema")?;

        Ok(Self {
            jobs: Arc::new(PostgresJobStore::with_clock(
                pool.clone(),
                settings.policies.clone(),
                clock,
            )),
            dataset: Arc::new(PostgresRankingDataset::new(pool.clone())),
            source: Arc::new(PostgresArtifactSource::new(pool)),
        })
    }
}

/// Handlers for every kind with a configured command.
pub fn handler_registry(settings: &Settings) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for (kind, commands) in &settings.commands {
        registry.register(*kind, commands.handler(settings.command_timeout));
    }
    registry
}

/// Everything `start` spawned.
pub struct Running {
    shutdown: CancellationToken,
    stores: Stores,
    workers: JobWorkerHandle,
    reaper: JoinHandle<()>,
    pipeline: PipelineHandle,
}

impl Running {
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Stop every loop and wait for in-flight jobs to be released.
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        let stats = self.workers.stats();
        self.workers.shutdown().await;
        if let Err(e) = self.reaper.await {
            error!(error = %e, "reaper task panicked");
        }
        let stages = self.pipeline.stats();
        self.pipeline.shutdown().await;

        info!(
            workers = %serde_json::to_string(&stats).unwrap_or_default(),
            stages = %serde_json::to_string(&stages).unwrap_or_default(),
            "sluice worker stopped"
        );
    }
}

pub async fn start(settings: Settings) -> anyhow::Result<Running> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = Stores::connect(&settings, clock.clone()).await?;
    Ok(start_with(settings, stores, clock))
}

pub fn start_with(settings: Settings, stores: Stores, clock: Arc<dyn Clock>) -> Running {
    let shutdown = CancellationToken::new();

    let registry = handler_registry(&settings);
    if registry.is_empty() {
        warn!("no job commands configured; only the reaper and ranking pipeline will run");
    } else {
        info!(kinds = ?registry.kinds(), "registered job handlers");
    }

    let workers = JobWorker::new(stores.jobs.clone(), registry, settings.policies.clone())
        .spawn(settings.worker.clone(), shutdown.clone());

    let reaper = Reaper::new(stores.jobs.clone(), ReaperConfig::from(&settings.worker))
        .spawn(shutdown.clone());

    let pipeline = ranking_pipeline(
        &settings.ranking,
        RankingSchedules::default(),
        &settings.worker.worker_id,
        stores.source.clone(),
        stores.dataset.clone(),
        stores.jobs.clone(),
        clock,
    )
    .spawn(shutdown.clone());

    Running {
        shutdown,
        stores,
        workers,
        reaper,
        pipeline,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use sluice_core::{JobKind, JobState};
    use sluice_infra::jobs::{JobObserver, NewJob};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_configured_commands_until_shutdown() {
        let settings = Settings::from_lookup(|key| match key {
            "SLUICE_WORKER_ID" => Some("test".into()),
            "SLUICE_POLL_INTERVAL_MS" => Some("10".into()),
            "SLUICE_PERMISSIONS_SYNC_COMMAND" => Some("true".into()),
            "SLUICE_CODEINTEL_INDEX_COMMAND" => Some("false".into()),
            _ => None,
        })
        .unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = Stores::in_memory(&settings, clock.clone());
        let running = start_with(settings, stores, clock);

        let jobs = running.stores().jobs.clone();
        let ok = jobs
            .enqueue(NewJob::new(JobKind::PermissionsSync, "repo"))
            .await
            .unwrap();
        let bad = jobs
            .enqueue(NewJob::new(JobKind::CodeIntelIndex, "upload"))
            .await
            .unwrap();

        let mut states = (JobState::Queued, JobState::Queued);
        for _ in 0..500 {
            states = (
                jobs.get(ok).await.unwrap().unwrap().state,
                jobs.get(bad).await.unwrap().unwrap().state,
            );
            if states == (JobState::Completed, JobState::Errored) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        running.shutdown().await;

        assert_eq!(states, (JobState::Completed, JobState::Errored));
        let logs = jobs.get(ok).await.unwrap().unwrap().execution_logs;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].exit_code, Some(0));
    }
}
