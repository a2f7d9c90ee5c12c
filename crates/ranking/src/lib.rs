//! `sluice-ranking`: ranking-signal domain.
//!
//! Source artifacts (per-repository symbol reference tables) are exported into
//! units, mapped into per-key partial aggregates and reduced into final ranks.
//! Everything here is pure; the pipeline stages that drive it live in the
//! infra crate.

pub mod aggregate;
pub mod artifact;
pub mod export;

pub use aggregate::{FinalRank, PartialAggregate, RankValue, map_unit};
pub use artifact::{Fingerprint, SourceArtifact, SymbolReference};
pub use export::{ExportUnit, UnitState, export_units};
