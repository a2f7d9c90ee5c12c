//! Ranking pipeline: export, map, reduce and clean up, coordinated only
//! through a shared `RankingDataset`.
//!
//! Each stage is a `StageRoutine` driven by the `PipelineOrchestrator` on its
//! own cadence; any number of instances of a stage may run at once.

pub mod dataset;
pub mod exporter;
pub mod janitor;
pub mod mapper;
pub mod orchestrator;
pub mod postgres;
pub mod reducer;
pub mod source;

pub use dataset::{
    DatasetCleanup, DatasetError, DatasetProgress, InMemoryRankingDataset, RankingDataset,
};
pub use exporter::Exporter;
pub use janitor::Janitor;
pub use mapper::Mapper;
pub use orchestrator::{
    PipelineHandle, PipelineOrchestrator, RankingConfig, RankingSchedules, StageError,
    StageReport, StageRoutine, StageSchedule, StageStats, ranking_pipeline,
};
pub use postgres::{PostgresArtifactSource, PostgresRankingDataset};
pub use reducer::Reducer;
pub use source::{ArtifactSource, InMemoryArtifactSource};
