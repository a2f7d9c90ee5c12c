//! Partial aggregates and their merge into final ranks.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::ExportUnitId;

use crate::export::ExportUnit;

/// Additive ranking signal.
///
/// `merge` is associative and commutative, so partials can be folded in any
/// order and in any grouping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RankValue {
    /// Number of references to the key.
    pub references: u64,
    /// Number of export units that referenced the key.
    pub units: u64,
}

impl RankValue {
    pub fn merge(self, other: RankValue) -> RankValue {
        RankValue {
            references: self.references.saturating_add(other.references),
            units: self.units.saturating_add(other.units),
        }
    }
}

/// Contribution of one export unit to one reduction key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialAggregate {
    pub graph_key: String,
    pub key: String,
    pub unit_id: ExportUnitId,
    pub value: RankValue,
}

/// Compute the partial aggregates of a unit, one per reduction key.
pub fn map_unit(unit: &ExportUnit) -> Vec<PartialAggregate> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for r in &unit.references {
        *counts.entry(r.symbol.as_str()).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(key, references)| PartialAggregate {
            graph_key: unit.graph_key.clone(),
            key: key.to_string(),
            unit_id: unit.id,
            value: RankValue {
                references,
                units: 1,
            },
        })
        .collect()
}

/// Finalized ranking value of a reduction key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalRank {
    pub graph_key: String,
    pub key: String,
    pub value: RankValue,
    /// Units already folded into `value`.
    pub merged_units: BTreeSet<ExportUnitId>,
    pub updated_at: DateTime<Utc>,
}

impl FinalRank {
    pub fn empty(graph_key: impl Into<String>, key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            graph_key: graph_key.into(),
            key: key.into(),
            value: RankValue::default(),
            merged_units: BTreeSet::new(),
            updated_at: now,
        }
    }

    /// Fold in partials whose unit has not been merged yet.
    ///
    /// Returns how many partials were absorbed; zero means the call changed
    /// nothing, which is what makes re-running the reducer safe.
    pub fn absorb<'a>(
        &mut self,
        partials: impl IntoIterator<Item = &'a PartialAggregate>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut absorbed = 0;
        for p in partials {
            if p.key != self.key || p.graph_key != self.graph_key {
                continue;
            }
            if self.merged_units.insert(p.unit_id) {
                self.value = self.value.merge(p.value);
                absorbed += 1;
            }
        }
        if absorbed > 0 {
            self.updated_at = now;
        }
        absorbed
    }
}
