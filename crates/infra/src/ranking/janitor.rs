//! Janitor stage: drop superseded dataset rows and expire finished jobs.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use sluice_core::Clock;

use crate::jobs::JobStore;

use super::dataset::RankingDataset;
use super::orchestrator::{RankingConfig, StageError, StageReport, StageRoutine};

pub struct Janitor {
    dataset: Arc<dyn RankingDataset>,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    graph_key: String,
    retention: Duration,
}

impl Janitor {
    pub fn new(
        dataset: Arc<dyn RankingDataset>,
        jobs: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: &RankingConfig,
    ) -> Self {
        Self {
            dataset,
            jobs,
            clock,
            graph_key: config.graph_key.clone(),
            retention: config.retention,
        }
    }
}

#[async_trait::async_trait]
impl StageRoutine for Janitor {
    fn name(&self) -> &'static str {
        "janitor"
    }

    async fn run_once(&self) -> Result<StageReport, StageError> {
        let cleanup = self.dataset.delete_stale(&self.graph_key).await?;

        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let jobs = self.jobs.delete_terminal_before(cutoff).await?;

        let removed = cleanup.units + cleanup.partials + cleanup.ranks + jobs;
        if removed > 0 {
            info!(
                graph_key = %self.graph_key,
                units = cleanup.units,
                partials = cleanup.partials,
                ranks = cleanup.ranks,
                jobs,
                "janitor removed stale rows"
            );
        }

        Ok(StageReport {
            processed: removed as usize,
            skipped: 0,
        })
    }
}
