//! Shared ranking dataset: export units, partial aggregates and final ranks.
//!
//! Pipeline stages coordinate only through this store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use sluice_core::ExportUnitId;
use sluice_ranking::{ExportUnit, FinalRank, Fingerprint, PartialAggregate, UnitState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatasetError {
    /// The mapper's claim expired and another mapper may own the unit.
    #[error("claim lost on export unit {0}")]
    ClaimLost(ExportUnitId),
    #[error("export unit not found: {0}")]
    UnitNotFound(ExportUnitId),
    #[error("dataset unavailable: {0}")]
    Unavailable(String),
    #[error("dataset storage error: {0}")]
    Storage(String),
}

/// Counts describing how far a graph key has converged.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DatasetProgress {
    pub units_exported: usize,
    pub units_mapping: usize,
    pub units_mapped: usize,
    pub partials: usize,
    pub ranks: usize,
}

impl DatasetProgress {
    pub fn units(&self) -> usize {
        self.units_exported + self.units_mapping + self.units_mapped
    }
}

/// Rows removed by one janitor sweep of the dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DatasetCleanup {
    pub units: u64,
    pub partials: u64,
    pub ranks: u64,
}

#[async_trait::async_trait]
pub trait RankingDataset: Send + Sync {
    /// Fingerprint per artifact already exported under `graph_key`.
    async fn exported_fingerprints(
        &self,
        graph_key: &str,
    ) -> Result<HashMap<i64, Fingerprint>, DatasetError>;

    /// Insert the units of one artifact atomically.
    ///
    /// Units already present (same graph key, artifact and chunk) are left
    /// untouched; returns how many were inserted.
    async fn insert_units(&self, units: Vec<ExportUnit>) -> Result<usize, DatasetError>;

    /// Claim up to `limit` claimable units for `mapper` until `now + ttl`.
    async fn claim_units(
        &self,
        graph_key: &str,
        mapper: &str,
        limit: usize,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportUnit>, DatasetError>;

    /// Store a unit's partials (overwriting any from an earlier attempt) and
    /// mark it mapped, provided `mapper` still holds the claim.
    async fn complete_unit(
        &self,
        unit_id: ExportUnitId,
        mapper: &str,
        partials: Vec<PartialAggregate>,
        now: DateTime<Utc>,
    ) -> Result<(), DatasetError>;

    /// Keys with unmerged partials whose contributing units are all mapped.
    async fn reducible_keys(&self, graph_key: &str, limit: usize) -> Result<Vec<String>, DatasetError>;

    /// Fold a key's unmerged partials into its final rank.
    ///
    /// Returns `None` when another reducer holds the key, otherwise the
    /// number of partials absorbed (zero when already up to date).
    async fn merge_key(
        &self,
        graph_key: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>, DatasetError>;

    async fn final_rank(&self, graph_key: &str, key: &str) -> Result<Option<FinalRank>, DatasetError>;

    async fn final_ranks(&self, graph_key: &str) -> Result<Vec<FinalRank>, DatasetError>;

    async fn progress(&self, graph_key: &str) -> Result<DatasetProgress, DatasetError>;

    /// Delete everything that belongs to graph keys other than `live_graph_key`,
    /// plus partials of the live key that are already merged.
    async fn delete_stale(&self, live_graph_key: &str) -> Result<DatasetCleanup, DatasetError>;
}

type RankKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    units: HashMap<ExportUnitId, ExportUnit>,
    partials: HashMap<(String, String, ExportUnitId), PartialAggregate>,
    ranks: HashMap<RankKey, FinalRank>,
}

/// In-memory dataset for tests/dev.
///
/// Merges hold a per-key mutex for their read-compute-write cycle, so
/// reducers working on different keys never wait on each other.
#[derive(Debug, Default)]
pub struct InMemoryRankingDataset {
    tables: RwLock<Tables>,
    key_locks: Mutex<HashMap<RankKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl InMemoryRankingDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, DatasetError> {
        self.tables
            .read()
            .map_err(|_| DatasetError::Storage("dataset lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, DatasetError> {
        self.tables
            .write()
            .map_err(|_| DatasetError::Storage("dataset lock poisoned".to_string()))
    }

    fn lock_table(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<RankKey, Arc<tokio::sync::Mutex<()>>>>, DatasetError> {
        self.key_locks
            .lock()
            .map_err(|_| DatasetError::Storage("key lock table poisoned".to_string()))
    }

    fn key_lock(&self, graph_key: &str, key: &str) -> Result<Arc<tokio::sync::Mutex<()>>, DatasetError> {
        Ok(self
            .lock_table()?
            .entry((graph_key.to_string(), key.to_string()))
            .or_default()
            .clone())
    }

    /// Drop the table's entry once nobody but the caller holds it.
    fn release_key_lock(
        &self,
        graph_key: &str,
        key: &str,
        lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Result<(), DatasetError> {
        let mut locks = self.lock_table()?;
        let entry = (graph_key.to_string(), key.to_string());
        let ours = locks.get(&entry).is_some_and(|l| Arc::ptr_eq(l, &lock));
        if ours && Arc::strong_count(&lock) == 2 {
            locks.remove(&entry);
        }
        Ok(())
    }

    fn absorb_partials(&self, graph_key: &str, key: &str, now: DateTime<Utc>) -> Result<usize, DatasetError> {
        let (mut rank, partials) = {
            let tables = self.read()?;
            let rank = tables
                .ranks
                .get(&(graph_key.to_string(), key.to_string()))
                .cloned()
                .unwrap_or_else(|| FinalRank::empty(graph_key, key, now));
            let partials: Vec<PartialAggregate> = tables
                .partials
                .values()
                .filter(|p| p.graph_key == graph_key && p.key == key)
                .cloned()
                .collect();
            (rank, partials)
        };

        let absorbed = rank.absorb(&partials, now);
        if absorbed > 0 {
            self.write()?
                .ranks
                .insert((graph_key.to_string(), key.to_string()), rank);
        }
        Ok(absorbed)
    }

    #[cfg(test)]
    fn tracked_key_locks(&self) -> usize {
        self.lock_table().map(|locks| locks.len()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RankingDataset for InMemoryRankingDataset {
    async fn exported_fingerprints(
        &self,
        graph_key: &str,
    ) -> Result<HashMap<i64, Fingerprint>, DatasetError> {
        Ok(self
            .read()?
            .units
            .values()
            .filter(|u| u.graph_key == graph_key)
            .map(|u| (u.artifact_id, u.fingerprint.clone()))
            .collect())
    }

    async fn insert_units(&self, units: Vec<ExportUnit>) -> Result<usize, DatasetError> {
        let mut tables = self.write()?;
        let existing: HashSet<(String, i64, u32)> = tables
            .units
            .values()
            .map(|u| (u.graph_key.clone(), u.artifact_id, u.chunk))
            .collect();

        let mut inserted = 0;
        for unit in units {
            if existing.contains(&(unit.graph_key.clone(), unit.artifact_id, unit.chunk)) {
                continue;
            }
            tables.units.insert(unit.id, unit);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_units(
        &self,
        graph_key: &str,
        mapper: &str,
        limit: usize,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportUnit>, DatasetError> {
        let expires = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut tables = self.write()?;

        let mut candidates: Vec<_> = tables
            .units
            .values()
            .filter(|u| u.graph_key == graph_key && u.is_claimable_at(now))
            .map(|u| (u.exported_at, u.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(unit) = tables.units.get_mut(&id) {
                unit.state = UnitState::Mapping;
                unit.claimed_by = Some(mapper.to_string());
                unit.claim_expires_at = Some(expires);
                claimed.push(unit.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_unit(
        &self,
        unit_id: ExportUnitId,
        mapper: &str,
        partials: Vec<PartialAggregate>,
        now: DateTime<Utc>,
    ) -> Result<(), DatasetError> {
        let mut tables = self.write()?;
        let unit = tables
            .units
            .get_mut(&unit_id)
            .ok_or(DatasetError::UnitNotFound(unit_id))?;
        if unit.state != UnitState::Mapping || unit.claimed_by.as_deref() != Some(mapper) {
            return Err(DatasetError::ClaimLost(unit_id));
        }

        unit.state = UnitState::Mapped;
        unit.claimed_by = None;
        unit.claim_expires_at = None;
        unit.mapped_at = Some(now);

        for p in partials {
            tables
                .partials
                .insert((p.graph_key.clone(), p.key.clone(), p.unit_id), p);
        }
        Ok(())
    }

    async fn reducible_keys(&self, graph_key: &str, limit: usize) -> Result<Vec<String>, DatasetError> {
        let tables = self.read()?;

        let pending: HashSet<&str> = tables
            .units
            .values()
            .filter(|u| u.graph_key == graph_key && !u.is_mapped())
            .flat_map(|u| u.reduction_keys.iter().map(String::as_str))
            .collect();

        let mut keys: Vec<String> = tables
            .partials
            .values()
            .filter(|p| p.graph_key == graph_key && !pending.contains(p.key.as_str()))
            .filter(|p| {
                tables
                    .ranks
                    .get(&(p.graph_key.clone(), p.key.clone()))
                    .is_none_or(|r| !r.merged_units.contains(&p.unit_id))
            })
            .map(|p| p.key.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn merge_key(
        &self,
        graph_key: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>, DatasetError> {
        let lock = self.key_lock(graph_key, key)?;
        let Ok(_guard) = lock.try_lock_owned() else {
            return Ok(None);
        };

        let (mut rank, partials) = {
            let tables = self.read()?;
            let rank = tables
                .ranks
                .get(&(graph_key.to_string(), key.to_string()))
                .cloned()
                .unwrap_or_else(|| FinalRank::empty(graph_key, key, now));
            let partials: Vec<PartialAggregate> = tables
                .partials
                .values()
                .filter(|p| p.graph_key == graph_key && p.key == key)
                .cloned()
                .collect();
            (rank, partials)
        };

        let absorbed = rank.absorb(&partials, now);
        if absorbed > 0 {
            self.write()?
                .ranks
                .insert((graph_key.to_string(), key.to_string()), rank);
        }
        Ok(Some(absorbed))
    }

    async fn final_rank(&self, graph_key: &str, key: &str) -> Result<Option<FinalRank>, DatasetError> {
        Ok(self
            .read()?
            .ranks
            .get(&(graph_key.to_string(), key.to_string()))
            .cloned())
    }

    async fn final_ranks(&self, graph_key: &str) -> Result<Vec<FinalRank>, DatasetError> {
        let mut ranks: Vec<_> = self
            .read()?
            .ranks
            .values()
            .filter(|r| r.graph_key == graph_key)
            .cloned()
            .collect();
        ranks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(ranks)
    }

    async fn progress(&self, graph_key: &str) -> Result<DatasetProgress, DatasetError> {
        let tables = self.read()?;
        let mut progress = DatasetProgress::default();
        for unit in tables.units.values().filter(|u| u.graph_key == graph_key) {
            match unit.state {
                UnitState::Exported => progress.units_exported += 1,
                UnitState::Mapping => progress.units_mapping += 1,
                UnitState::Mapped => progress.units_mapped += 1,
            }
        }
        progress.partials = tables
            .partials
            .values()
            .filter(|p| p.graph_key == graph_key)
            .count();
        progress.ranks = tables
            .ranks
            .values()
            .filter(|r| r.graph_key == graph_key)
            .count();
        Ok(progress)
    }

    async fn delete_stale(&self, live_graph_key: &str) -> Result<DatasetCleanup, DatasetError> {
        let mut tables = self.write()?;
        let Tables {
            units,
            partials,
            ranks,
        } = &mut *tables;
        let mut cleanup = DatasetCleanup::default();

        let before = units.len();
        units.retain(|_, u| u.graph_key == live_graph_key);
        cleanup.units = (before - units.len()) as u64;

        let before = partials.len();
        partials.retain(|(graph_key, key, unit_id), _| {
            graph_key == live_graph_key
                && ranks
                    .get(&(graph_key.clone(), key.clone()))
                    .is_none_or(|r| !r.merged_units.contains(unit_id))
        });
        cleanup.partials = (before - partials.len()) as u64;

        let before = ranks.len();
        ranks.retain(|(graph_key, _), _| graph_key == live_graph_key);
        cleanup.ranks = (before - ranks.len()) as u64;
        drop(tables);

        self.lock_table()?
            .retain(|(graph_key, _), _| graph_key == live_graph_key);

        Ok(cleanup)
    }
}
