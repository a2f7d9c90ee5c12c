//! Postgres-backed ranking dataset and artifact source.
//!
//! Mappers claim units with `FOR UPDATE SKIP LOCKED`; reducers lock the final
//! rank row of one key the same way, so concurrent reducers on different keys
//! never wait on each other and a busy key is skipped. The rank row is created
//! by a separate statement first, so even a brand-new key is never waited on.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use sluice_core::ExportUnitId;
use sluice_ranking::{
    ExportUnit, FinalRank, Fingerprint, PartialAggregate, RankValue, SourceArtifact, UnitState,
};

use super::dataset::{DatasetCleanup, DatasetError, DatasetProgress, RankingDataset};
use super::source::ArtifactSource;

const UNIT_COLUMNS: &str = r#"
    id, graph_key, artifact_id, repository, fingerprint, chunk, "references",
    reduction_keys, state, claimed_by, claim_expires_at, exported_at, mapped_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresRankingDataset {
    pool: PgPool,
}

impl PostgresRankingDataset {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RankingDataset for PostgresRankingDataset {
    #[instrument(skip(self), err)]
    async fn exported_fingerprints(
        &self,
        graph_key: &str,
    ) -> Result<HashMap<i64, Fingerprint>, DatasetError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT artifact_id, fingerprint
            FROM sluice_ranking_units
            WHERE graph_key = $1
            "#,
        )
        .bind(graph_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("exported_fingerprints", e))?;

        rows.iter()
            .map(|row| -> Result<(i64, Fingerprint), DatasetError> {
                let id: i64 = row.try_get("artifact_id").map_err(|e| map_sqlx_error("exported_fingerprints", e))?;
                let fp: String = row.try_get("fingerprint").map_err(|e| map_sqlx_error("exported_fingerprints", e))?;
                Ok((id, Fingerprint::from_hex(fp)))
            })
            .collect()
    }

    #[instrument(skip(self, units), fields(units = units.len()), err)]
    async fn insert_units(&self, units: Vec<ExportUnit>) -> Result<usize, DatasetError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut inserted = 0;
        for unit in &units {
            let references = serde_json::to_value(&unit.references)
                .map_err(|e| DatasetError::Storage(format!("failed to encode references: {e}")))?;
            let keys: Vec<&str> = unit.reduction_keys.iter().map(String::as_str).collect();

            let result = sqlx::query(&format!(
                r#"
                INSERT INTO sluice_ranking_units ({UNIT_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (graph_key, artifact_id, chunk) DO NOTHING
                "#
            ))
            .bind(unit.id.as_uuid())
            .bind(&unit.graph_key)
            .bind(unit.artifact_id)
            .bind(&unit.repository)
            .bind(unit.fingerprint.as_str())
            .bind(unit.chunk as i32)
            .bind(references)
            .bind(keys)
            .bind(unit.state.as_str())
            .bind(unit.claimed_by.as_deref())
            .bind(unit.claim_expires_at)
            .bind(unit.exported_at)
            .bind(unit.mapped_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_units", e))?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_units", e))?;
        Ok(inserted)
    }

    #[instrument(skip(self), err)]
    async fn claim_units(
        &self,
        graph_key: &str,
        mapper: &str,
        limit: usize,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportUnit>, DatasetError> {
        let expires = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let rows = sqlx::query(&format!(
            r#"
            UPDATE sluice_ranking_units
            SET state = 'mapping', claimed_by = $2, claim_expires_at = $3
            WHERE id IN (
                SELECT id FROM sluice_ranking_units
                WHERE graph_key = $1
                  AND (state = 'exported'
                       OR (state = 'mapping' AND (claim_expires_at IS NULL OR claim_expires_at <= $4)))
                ORDER BY exported_at ASC, id ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {UNIT_COLUMNS}
            "#
        ))
        .bind(graph_key)
        .bind(mapper)
        .bind(expires)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_units", e))?;

        let mut units: Vec<ExportUnit> = rows.iter().map(unit_from_row).collect::<Result<_, _>>()?;
        units.sort_by_key(|u| (u.exported_at, u.id));
        Ok(units)
    }

    #[instrument(skip(self, partials), fields(unit_id = %unit_id, partials = partials.len()), err)]
    async fn complete_unit(
        &self,
        unit_id: ExportUnitId,
        mapper: &str,
        partials: Vec<PartialAggregate>,
        now: DateTime<Utc>,
    ) -> Result<(), DatasetError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            "SELECT graph_key, state, claimed_by FROM sluice_ranking_units WHERE id = $1 FOR UPDATE",
        )
        .bind(unit_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("complete_unit", e))?
        .ok_or(DatasetError::UnitNotFound(unit_id))?;

        let graph_key: String = row.try_get("graph_key").map_err(|e| map_sqlx_error("complete_unit", e))?;
        let state: String = row.try_get("state").map_err(|e| map_sqlx_error("complete_unit", e))?;
        let claimed_by: Option<String> = row.try_get("claimed_by").map_err(|e| map_sqlx_error("complete_unit", e))?;
        if state != UnitState::Mapping.as_str() || claimed_by.as_deref() != Some(mapper) {
            return Err(DatasetError::ClaimLost(unit_id));
        }

        let keys: Vec<&str> = partials.iter().map(|p| p.key.as_str()).collect();
        let references: Vec<i64> = partials.iter().map(|p| to_i64(p.value.references)).collect();
        let counts: Vec<i64> = partials.iter().map(|p| to_i64(p.value.units)).collect();

        sqlx::query(
            r#"
            INSERT INTO sluice_ranking_partials (graph_key, key, unit_id, "references", units)
            SELECT $1, t.key, $2, t.refs, t.units
            FROM UNNEST($3::text[], $4::bigint[], $5::bigint[]) AS t(key, refs, units)
            ON CONFLICT (graph_key, key, unit_id)
            DO UPDATE SET "references" = EXCLUDED."references", units = EXCLUDED.units
            "#,
        )
        .bind(&graph_key)
        .bind(unit_id.as_uuid())
        .bind(keys)
        .bind(references)
        .bind(counts)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("complete_unit", e))?;

        sqlx::query(
            r#"
            UPDATE sluice_ranking_units
            SET state = 'mapped', claimed_by = NULL, claim_expires_at = NULL, mapped_at = $2
            WHERE id = $1
            "#,
        )
        .bind(unit_id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("complete_unit", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("complete_unit", e))
    }

    #[instrument(skip(self), err)]
    async fn reducible_keys(&self, graph_key: &str, limit: usize) -> Result<Vec<String>, DatasetError> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT p.key
            FROM sluice_ranking_partials p
            LEFT JOIN sluice_ranking_ranks r
                ON r.graph_key = p.graph_key AND r.key = p.key
            WHERE p.graph_key = $1
              AND (r.key IS NULL OR NOT (p.unit_id = ANY(r.merged_units)))
              AND NOT EXISTS (
                  SELECT 1 FROM sluice_ranking_units u
                  WHERE u.graph_key = $1
                    AND u.state <> 'mapped'
                    AND u.reduction_keys @> ARRAY[p.key]
              )
            ORDER BY p.key
            LIMIT $2
            "#,
        )
        .bind(graph_key)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reducible_keys", e))
    }

    #[instrument(skip(self), err)]
    async fn merge_key(
        &self,
        graph_key: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>, DatasetError> {
        // Create the row in its own statement so that, inside the transaction,
        // a key another reducer holds is skipped instead of waited on.
        sqlx::query(
            r#"
            INSERT INTO sluice_ranking_ranks (graph_key, key, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (graph_key, key) DO NOTHING
            "#,
        )
        .bind(graph_key)
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("merge_key", e))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            SELECT graph_key, key, "references", units, merged_units, updated_at
            FROM sluice_ranking_ranks
            WHERE graph_key = $1 AND key = $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(graph_key)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("merge_key", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut rank = rank_from_row(&row)?;

        let partials: Vec<PartialAggregate> = sqlx::query(
            r#"
            SELECT graph_key, key, unit_id, "references", units
            FROM sluice_ranking_partials
            WHERE graph_key = $1 AND key = $2
            "#,
        )
        .bind(graph_key)
        .bind(key)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("merge_key", e))?
        .iter()
        .map(partial_from_row)
        .collect::<Result<_, _>>()?;

        let absorbed = rank.absorb(&partials, now);
        if absorbed == 0 {
            // Nothing merged yet; an empty row would show up as a zero rank.
            sqlx::query(
                r#"
                DELETE FROM sluice_ranking_ranks
                WHERE graph_key = $1 AND key = $2 AND cardinality(merged_units) = 0
                "#,
            )
            .bind(graph_key)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("merge_key", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("merge_key", e))?;
            return Ok(Some(0));
        }

        let merged: Vec<uuid::Uuid> = rank.merged_units.iter().map(|u| *u.as_uuid()).collect();
        sqlx::query(
            r#"
            UPDATE sluice_ranking_ranks
            SET "references" = $3, units = $4, merged_units = $5, updated_at = $6
            WHERE graph_key = $1 AND key = $2
            "#,
        )
        .bind(graph_key)
        .bind(key)
        .bind(to_i64(rank.value.references))
        .bind(to_i64(rank.value.units))
        .bind(merged)
        .bind(rank.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("merge_key", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("merge_key", e))?;
        Ok(Some(absorbed))
    }

    #[instrument(skip(self), err)]
    async fn final_rank(&self, graph_key: &str, key: &str) -> Result<Option<FinalRank>, DatasetError> {
        let row = sqlx::query(
            r#"
            SELECT graph_key, key, "references", units, merged_units, updated_at
            FROM sluice_ranking_ranks
            WHERE graph_key = $1 AND key = $2 AND cardinality(merged_units) > 0
            "#,
        )
        .bind(graph_key)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("final_rank", e))?;

        row.map(|r| rank_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn final_ranks(&self, graph_key: &str) -> Result<Vec<FinalRank>, DatasetError> {
        let rows = sqlx::query(
            r#"
            SELECT graph_key, key, "references", units, merged_units, updated_at
            FROM sluice_ranking_ranks
            WHERE graph_key = $1 AND cardinality(merged_units) > 0
            ORDER BY key
            "#,
        )
        .bind(graph_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("final_ranks", e))?;

        rows.iter().map(rank_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn progress(&self, graph_key: &str) -> Result<DatasetProgress, DatasetError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM sluice_ranking_units WHERE graph_key = $1 AND state = 'exported') AS exported,
                (SELECT COUNT(*) FROM sluice_ranking_units WHERE graph_key = $1 AND state = 'mapping') AS mapping,
                (SELECT COUNT(*) FROM sluice_ranking_units WHERE graph_key = $1 AND state = 'mapped') AS mapped,
                (SELECT COUNT(*) FROM sluice_ranking_partials WHERE graph_key = $1) AS partials,
                (SELECT COUNT(*) FROM sluice_ranking_ranks
                    WHERE graph_key = $1 AND cardinality(merged_units) > 0) AS ranks
            "#,
        )
        .bind(graph_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("progress", e))?;

        let count = |column: &str| -> Result<usize, DatasetError> {
            let n: i64 = row.try_get(column).map_err(|e| map_sqlx_error("progress", e))?;
            Ok(n.max(0) as usize)
        };
        Ok(DatasetProgress {
            units_exported: count("exported")?,
            units_mapping: count("mapping")?,
            units_mapped: count("mapped")?,
            partials: count("partials")?,
            ranks: count("ranks")?,
        })
    }

    #[instrument(skip(self), err)]
    async fn delete_stale(&self, live_graph_key: &str) -> Result<DatasetCleanup, DatasetError> {
        let units = sqlx::query("DELETE FROM sluice_ranking_units WHERE graph_key <> $1")
            .bind(live_graph_key)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_stale_units", e))?
            .rows_affected();

        let partials = sqlx::query(
            r#"
            DELETE FROM sluice_ranking_partials p
            WHERE p.graph_key <> $1
               OR EXISTS (
                   SELECT 1 FROM sluice_ranking_ranks r
                   WHERE r.graph_key = p.graph_key
                     AND r.key = p.key
                     AND p.unit_id = ANY(r.merged_units)
               )
            "#,
        )
        .bind(live_graph_key)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_stale_partials", e))?
        .rows_affected();

        let ranks = sqlx::query("DELETE FROM sluice_ranking_ranks WHERE graph_key <> $1")
            .bind(live_graph_key)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_stale_ranks", e))?
            .rows_affected();

        Ok(DatasetCleanup {
            units,
            partials,
            ranks,
        })
    }
}

/// Reads the artifact table the upload pipeline writes.
#[derive(Debug, Clone)]
pub struct PostgresArtifactSource {
    pool: PgPool,
}

impl PostgresArtifactSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ArtifactSource for PostgresArtifactSource {
    #[instrument(skip(self), err)]
    async fn list_artifacts(
        &self,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SourceArtifact>, DatasetError> {
        let rows = sqlx::query(
            r#"
            SELECT artifact_id, repository, "references"
            FROM sluice_ranking_artifacts
            WHERE ($1::bigint IS NULL OR artifact_id > $1)
            ORDER BY artifact_id ASC
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_artifacts", e))?;

        rows.iter()
            .map(|row| -> Result<SourceArtifact, DatasetError> {
                let get = |e| map_sqlx_error("list_artifacts", e);
                let references: serde_json::Value = row.try_get("references").map_err(get)?;
                Ok(SourceArtifact {
                    artifact_id: row.try_get("artifact_id").map_err(get)?,
                    repository: row.try_get("repository").map_err(get)?,
                    references: serde_json::from_value(references)
                        .map_err(|e| DatasetError::Storage(format!("corrupt artifact references: {e}")))?,
                })
            })
            .collect()
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn unit_from_row(row: &PgRow) -> Result<ExportUnit, DatasetError> {
    let get = |e| map_sqlx_error("decode_unit", e);

    let state: String = row.try_get("state").map_err(get)?;
    let chunk: i32 = row.try_get("chunk").map_err(get)?;
    let fingerprint: String = row.try_get("fingerprint").map_err(get)?;
    let references: serde_json::Value = row.try_get("references").map_err(get)?;
    let keys: Vec<String> = row.try_get("reduction_keys").map_err(get)?;

    Ok(ExportUnit {
        id: ExportUnitId::from_uuid(row.try_get("id").map_err(get)?),
        graph_key: row.try_get("graph_key").map_err(get)?,
        artifact_id: row.try_get("artifact_id").map_err(get)?,
        repository: row.try_get("repository").map_err(get)?,
        fingerprint: Fingerprint::from_hex(fingerprint),
        chunk: chunk.max(0) as u32,
        references: serde_json::from_value(references)
            .map_err(|e| DatasetError::Storage(format!("corrupt unit references: {e}")))?,
        reduction_keys: keys.into_iter().collect(),
        state: UnitState::parse(&state)
            .ok_or_else(|| DatasetError::Storage(format!("unknown unit state: {state}")))?,
        claimed_by: row.try_get("claimed_by").map_err(get)?,
        claim_expires_at: row.try_get("claim_expires_at").map_err(get)?,
        exported_at: row.try_get("exported_at").map_err(get)?,
        mapped_at: row.try_get("mapped_at").map_err(get)?,
    })
}

fn partial_from_row(row: &PgRow) -> Result<PartialAggregate, DatasetError> {
    let get = |e| map_sqlx_error("decode_partial", e);
    let references: i64 = row.try_get("references").map_err(get)?;
    let units: i64 = row.try_get("units").map_err(get)?;

    Ok(PartialAggregate {
        graph_key: row.try_get("graph_key").map_err(get)?,
        key: row.try_get("key").map_err(get)?,
        unit_id: ExportUnitId::from_uuid(row.try_get("unit_id").map_err(get)?),
        value: RankValue {
            references: references.max(0) as u64,
            units: units.max(0) as u64,
        },
    })
}

fn rank_from_row(row: &PgRow) -> Result<FinalRank, DatasetError> {
    let get = |e| map_sqlx_error("decode_rank", e);
    let references: i64 = row.try_get("references").map_err(get)?;
    let units: i64 = row.try_get("units").map_err(get)?;
    let merged: Vec<uuid::Uuid> = row.try_get("merged_units").map_err(get)?;

    Ok(FinalRank {
        graph_key: row.try_get("graph_key").map_err(get)?,
        key: row.try_get("key").map_err(get)?,
        value: RankValue {
            references: references.max(0) as u64,
            units: units.max(0) as u64,
        },
        merged_units: merged.into_iter().map(ExportUnitId::from_uuid).collect::<BTreeSet<_>>(),
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DatasetError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            DatasetError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => DatasetError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => DatasetError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => DatasetError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => DatasetError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
