//! Reduce stage: partial aggregates into final ranks.

use std::sync::Arc;

use tracing::{debug, info};

use sluice_core::Clock;

use super::dataset::RankingDataset;
use super::orchestrator::{RankingConfig, StageError, StageReport, StageRoutine};

pub struct Reducer {
    dataset: Arc<dyn RankingDataset>,
    clock: Arc<dyn Clock>,
    graph_key: String,
    batch_size: usize,
}

impl Reducer {
    pub fn new(dataset: Arc<dyn RankingDataset>, clock: Arc<dyn Clock>, config: &RankingConfig) -> Self {
        Self {
            dataset,
            clock,
            graph_key: config.graph_key.clone(),
            batch_size: config.reduce_batch_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl StageRoutine for Reducer {
    fn name(&self) -> &'static str {
        "reducer"
    }

    async fn run_once(&self) -> Result<StageReport, StageError> {
        let keys = self
            .dataset
            .reducible_keys(&self.graph_key, self.batch_size)
            .await?;

        let mut report = StageReport::default();
        for key in keys {
            match self
                .dataset
                .merge_key(&self.graph_key, &key, self.clock.now())
                .await?
            {
                Some(absorbed) if absorbed > 0 => {
                    debug!(key = %key, absorbed, "merged partials");
                    report.processed += 1;
                }
                // Already merged, or another reducer holds the key.
                _ => report.skipped += 1,
            }
        }

        if report.processed > 0 {
            info!(graph_key = %self.graph_key, keys = report.processed, "reduced keys");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::dataset::InMemoryRankingDataset;
    use chrono::Utc;
    use sluice_core::SystemClock;
    use sluice_ranking::{RankValue, SourceArtifact, SymbolReference, export_units, map_unit};
    use std::time::Duration;

    #[tokio::test]
    async fn rerun_changes_nothing() {
        let dataset = InMemoryRankingDataset::arc();
        let now = Utc::now();
        for id in 1..=3 {
            let artifact = SourceArtifact {
                artifact_id: id,
                repository: format!("r{id}"),
                references: vec![
                    SymbolReference::new("Shared", "a.go"),
                    SymbolReference::new(format!("Own{id}"), "b.go"),
                ],
            };
            dataset
                .insert_units(export_units(&artifact, "g1", 10, now))
                .await
                .unwrap();
        }
        for unit in dataset
            .claim_units("g1", "m", 10, Duration::from_secs(60), now)
            .await
            .unwrap()
        {
            dataset
                .complete_unit(unit.id, "m", map_unit(&unit), now)
                .await
                .unwrap();
        }

        let reducer = Reducer::new(dataset.clone(), Arc::new(SystemClock), &RankingConfig::new("g1"));
        assert_eq!(reducer.run_once().await.unwrap().processed, 4);
        let before = dataset.final_ranks("g1").await.unwrap();

        assert_eq!(reducer.run_once().await.unwrap(), StageReport::default());
        assert_eq!(dataset.final_ranks("g1").await.unwrap(), before);

        let shared = dataset.final_rank("g1", "Shared").await.unwrap().unwrap();
        assert_eq!(shared.value, RankValue { references: 3, units: 3 });
    }
}
