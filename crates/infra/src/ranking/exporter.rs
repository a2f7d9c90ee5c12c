//! Export stage: source artifacts into export units.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use sluice_core::Clock;
use sluice_ranking::{Fingerprint, SourceArtifact, export_units};

use super::dataset::RankingDataset;
use super::orchestrator::{RankingConfig, StageError, StageReport, StageRoutine};
use super::source::ArtifactSource;

/// What the current pass knows about an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactStatus {
    New,
    /// Already exported with the same content; nothing to do.
    Unchanged,
    /// Exported earlier with different content; left for the next graph key.
    Changed,
}

/// Exported fingerprints of the graph key, loaded once per pass.
#[derive(Debug)]
struct ExportPass {
    exported: HashMap<i64, Fingerprint>,
}

impl ExportPass {
    fn status(&self, artifact: &SourceArtifact, fingerprint: &Fingerprint) -> ArtifactStatus {
        match self.exported.get(&artifact.artifact_id) {
            None => ArtifactStatus::New,
            Some(fp) if fp == fingerprint => ArtifactStatus::Unchanged,
            Some(_) => ArtifactStatus::Changed,
        }
    }

    fn record(&mut self, artifact_id: i64, fingerprint: Fingerprint) {
        self.exported.insert(artifact_id, fingerprint);
    }
}

pub struct Exporter {
    source: Arc<dyn ArtifactSource>,
    dataset: Arc<dyn RankingDataset>,
    clock: Arc<dyn Clock>,
    graph_key: String,
    chunk_size: usize,
    page_size: usize,
}

impl Exporter {
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        dataset: Arc<dyn RankingDataset>,
        clock: Arc<dyn Clock>,
        config: &RankingConfig,
    ) -> Self {
        Self {
            source,
            dataset,
            clock,
            graph_key: config.graph_key.clone(),
            chunk_size: config.chunk_size,
            page_size: config.export_page_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl StageRoutine for Exporter {
    fn name(&self) -> &'static str {
        "exporter"
    }

    async fn run_once(&self) -> Result<StageReport, StageError> {
        let mut pass = ExportPass {
            exported: self.dataset.exported_fingerprints(&self.graph_key).await?,
        };
        let mut report = StageReport::default();
        let mut after = None;

        loop {
            let page = self.source.list_artifacts(after, self.page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.artifact_id);

            for artifact in &page {
                let fingerprint = artifact.fingerprint();
                match pass.status(artifact, &fingerprint) {
                    ArtifactStatus::New => {}
                    ArtifactStatus::Unchanged => {
                        report.skipped += 1;
                        continue;
                    }
                    ArtifactStatus::Changed => {
                        debug!(
                            artifact_id = artifact.artifact_id,
                            graph_key = %self.graph_key,
                            "artifact changed after export, deferring to next graph key"
                        );
                        report.skipped += 1;
                        continue;
                    }
                }

                let units = export_units(artifact, &self.graph_key, self.chunk_size, self.clock.now());
                let inserted = self.dataset.insert_units(units).await?;
                pass.record(artifact.artifact_id, fingerprint);
                if inserted > 0 {
                    report.processed += 1;
                } else {
                    // Another exporter got there first.
                    report.skipped += 1;
                }
            }

            if page.len() < self.page_size {
                break;
            }
        }

        if report.processed > 0 {
            info!(graph_key = %self.graph_key, exported = report.processed, "exported artifacts");
        }
        Ok(report)
    }
}
