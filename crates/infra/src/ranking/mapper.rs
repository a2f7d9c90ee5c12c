//! Map stage: export units into partial aggregates.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use sluice_core::Clock;
use sluice_ranking::map_unit;

use super::dataset::{DatasetError, RankingDataset};
use super::orchestrator::{RankingConfig, StageError, StageReport, StageRoutine};

pub struct Mapper {
    dataset: Arc<dyn RankingDataset>,
    clock: Arc<dyn Clock>,
    graph_key: String,
    mapper_id: String,
    batch_size: usize,
    claim_ttl: Duration,
}

impl Mapper {
    pub fn new(
        dataset: Arc<dyn RankingDataset>,
        clock: Arc<dyn Clock>,
        mapper_id: impl Into<String>,
        config: &RankingConfig,
    ) -> Self {
        Self {
            dataset,
            clock,
            graph_key: config.graph_key.clone(),
            mapper_id: mapper_id.into(),
            batch_size: config.map_batch_size.max(1),
            claim_ttl: config.claim_ttl,
        }
    }
}

#[async_trait::async_trait]
impl StageRoutine for Mapper {
    fn name(&self) -> &'static str {
        "mapper"
    }

    async fn run_once(&self) -> Result<StageReport, StageError> {
        // Fresh claim identity per batch; concurrent instances never share claims.
        let claimant = format!("{}#{}", self.mapper_id, uuid::Uuid::now_v7());
        let units = self
            .dataset
            .claim_units(
                &self.graph_key,
                &claimant,
                self.batch_size,
                self.claim_ttl,
                self.clock.now(),
            )
            .await?;

        let mut report = StageReport::default();
        for unit in units {
            let partials = map_unit(&unit);
            debug!(unit_id = %unit.id, keys = partials.len(), "mapped unit");

            match self
                .dataset
                .complete_unit(unit.id, &claimant, partials, self.clock.now())
                .await
            {
                Ok(()) => report.processed += 1,
                Err(DatasetError::ClaimLost(id)) => {
                    warn!(unit_id = %id, mapper = %claimant, "claim expired before the unit was mapped");
                    report.skipped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }
}
