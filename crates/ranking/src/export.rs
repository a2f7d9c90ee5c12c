//! Export units: the intermediate form the mapper consumes.
//!
//! One artifact becomes one or more units (chunks of references). Units are
//! identified within a graph key by `(fingerprint, chunk)`, which is what makes
//! re-exporting unchanged content a no-op.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::ExportUnitId;

use crate::artifact::{Fingerprint, SourceArtifact, SymbolReference};

/// Mapping progress of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Exported,
    /// Claimed by a mapper until `claim_expires_at`.
    Mapping,
    Mapped,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Exported => "exported",
            UnitState::Mapping => "mapping",
            UnitState::Mapped => "mapped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exported" => Some(UnitState::Exported),
            "mapping" => Some(UnitState::Mapping),
            "mapped" => Some(UnitState::Mapped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportUnit {
    pub id: ExportUnitId,
    pub graph_key: String,
    pub artifact_id: i64,
    pub repository: String,
    pub fingerprint: Fingerprint,
    pub chunk: u32,
    pub references: Vec<SymbolReference>,
    /// Reduction keys this unit contributes to.
    pub reduction_keys: BTreeSet<String>,
    pub state: UnitState,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub exported_at: DateTime<Utc>,
    pub mapped_at: Option<DateTime<Utc>>,
}

impl ExportUnit {
    /// Whether a mapper may claim this unit at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            UnitState::Exported => true,
            UnitState::Mapping => self.claim_expires_at.is_none_or(|at| at <= now),
            UnitState::Mapped => false,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.state == UnitState::Mapped
    }
}

/// Split an artifact into units of at most `chunk_size` references.
///
/// An artifact without references still yields one (empty) unit so that its
/// fingerprint is recorded as exported.
pub fn export_units(
    artifact: &SourceArtifact,
    graph_key: &str,
    chunk_size: usize,
    now: DateTime<Utc>,
) -> Vec<ExportUnit> {
    let fingerprint = artifact.fingerprint();
    let mut references = artifact.references.clone();
    references.sort();

    let chunks: Vec<Vec<SymbolReference>> = if references.is_empty() {
        vec![Vec::new()]
    } else {
        references
            .chunks(chunk_size.max(1))
            .map(|c| c.to_vec())
            .collect()
    };

    chunks
        .into_iter()
        .enumerate()
        .map(|(chunk, references)| ExportUnit {
            id: ExportUnitId::new(),
            graph_key: graph_key.to_string(),
            artifact_id: artifact.artifact_id,
            repository: artifact.repository.clone(),
            fingerprint: fingerprint.clone(),
            chunk: chunk as u32,
            reduction_keys: references.iter().map(|r| r.symbol.clone()).collect(),
            references,
            state: UnitState::Exported,
            claimed_by: None,
            claim_expires_at: None,
            exported_at: now,
            mapped_at: None,
        })
        .collect()
}
