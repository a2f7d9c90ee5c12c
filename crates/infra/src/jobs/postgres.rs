//! Postgres-backed job store.
//!
//! Every operation touches one row inside a short transaction, except
//! `mark_complete_and_chain`, which also inserts the successor. Rows are
//! locked with `FOR UPDATE`; `dequeue` and `reclaim_stale` add `SKIP LOCKED`
//! so concurrent workers never block on (or receive) the same row. State
//! changes are computed by the [`JobRecord`] methods and written back whole.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | PoolTimedOut, PoolClosed, Io, Tls | `Unavailable` |
//! | Database, decode failures, other | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use sluice_core::{
    Clock, CompletedJob, DomainError, ExecutionLogEntry, JobId, JobKind, JobPolicies, JobRecord,
    JobStage, JobState, PayloadRef, SystemClock, Transition,
};

use super::store::{
    JobFilter, JobObserver, JobStats, JobStore, JobStoreError, NewJob, ReclaimedJob,
};

const JOB_COLUMNS: &str = r#"
    id, kind, payload_ref, stage, predecessor_id, state, failure_message,
    process_after, started_at, finished_at, num_resets, num_failures,
    last_heartbeat_at, worker_hostname, execution_logs, created_at, updated_at
"#;

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    policies: Arc<JobPolicies>,
    clock: Arc<dyn Clock>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, policies: JobPolicies) -> Self {
        Self::with_clock(pool, policies, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, policies: JobPolicies, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            policies: Arc::new(policies),
            clock,
        }
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Run `f` against a row the worker still owns, then persist it.
    async fn with_owned<T>(
        &self,
        operation: &'static str,
        id: JobId,
        worker: &str,
        f: impl FnOnce(&mut JobRecord) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, id, false)
            .await?
            .ok_or(JobStoreError::NotFound(id))?;
        if !job.is_leased_by(worker) {
            return Err(JobStoreError::LeaseLost(id));
        }

        let out = f(&mut job)?;
        write_job(&mut tx, &job, operation).await?;
        commit(tx, operation).await?;
        Ok(out)
    }
}

#[async_trait::async_trait]
impl JobObserver for PostgresJobStore {
    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sluice_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM sluice_jobs
            WHERE ($1::text IS NULL OR kind = $1)
              AND ($2::text IS NULL OR state = $2)
              AND ($3::text IS NULL OR stage = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at < $5)
            ORDER BY created_at ASC, id ASC
            LIMIT $6
            "#
        ))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.stage.map(|s| s.as_str()))
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, kind: Option<JobKind>) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS count
            FROM sluice_jobs
            WHERE ($1::text IS NULL OR kind = $1)
            GROUP BY state
            "#,
        )
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            stats.record(parse_column(&state)?, count.max(0) as usize);
        }
        Ok(stats)
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(kind = %job.kind), err)]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let record = job.into_record(self.clock.now())?;
        insert_job(&self.pool, &record, "enqueue").await?;
        Ok(record.id)
    }

    #[instrument(skip(self, completed), fields(job_id = %completed.id(), kind = %completed.kind()), err)]
    async fn enqueue_next_stage(&self, completed: &CompletedJob) -> Result<JobId, JobStoreError> {
        let mut tx = self.begin().await?;

        // Locking the predecessor serializes concurrent chaining of the same stage.
        let prev = lock_job(&mut tx, completed.id(), false)
            .await?
            .ok_or(JobStoreError::NotFound(completed.id()))?;
        if prev.state != JobState::Completed {
            return Err(DomainError::stage_order(
                completed.kind(),
                format!("predecessor {} is {}", prev.id, prev.state),
            )
            .into());
        }

        let existing: Option<uuid::Uuid> =
            sqlx::query_scalar("SELECT id FROM sluice_jobs WHERE predecessor_id = $1")
                .bind(completed.id().as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("enqueue_next_stage", e))?;
        if let Some(id) = existing {
            commit(tx, "enqueue_next_stage").await?;
            return Ok(JobId::from_uuid(id));
        }

        let record = JobRecord::successor(completed, self.clock.now())?;
        insert_job(&mut *tx, &record, "enqueue_next_stage").await?;
        commit(tx, "enqueue_next_stage").await?;
        Ok(record.id)
    }

    #[instrument(skip(self), fields(kind = %kind), err)]
    async fn dequeue(&self, kind: JobKind, worker: &str) -> Result<Option<JobRecord>, JobStoreError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM sluice_jobs
            WHERE kind = $1
              AND state = ANY($2)
              AND (process_after IS NULL OR process_after <= $3)
            ORDER BY COALESCE(process_after, created_at) ASC, created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(kind.as_str())
        .bind(Transition::Lease.source_names())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("dequeue", e))?;

        let Some(row) = row else {
            commit(tx, "dequeue").await?;
            return Ok(None);
        };

        let mut job = job_from_row(&row)?;
        job.lease(worker, now)?;
        write_job(&mut tx, &job, "dequeue").await?;
        commit(tx, "dequeue").await?;
        Ok(Some(job))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn heartbeat(&self, id: JobId, worker: &str) -> Result<(), JobStoreError> {
        // Single conditional update; no need to load the row.
        let result = sqlx::query(
            r#"
            UPDATE sluice_jobs
            SET last_heartbeat_at = $3, updated_at = $3
            WHERE id = $1 AND state = 'processing' AND worker_hostname = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::LeaseLost(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_complete(&self, id: JobId, worker: &str) -> Result<CompletedJob, JobStoreError> {
        let now = self.clock.now();
        self.with_owned("mark_complete", id, worker, |job| Ok(job.complete(now)?))
            .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_complete_and_chain(
        &self,
        id: JobId,
        worker: &str,
    ) -> Result<(CompletedJob, Option<JobId>), JobStoreError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, id, false)
            .await?
            .ok_or(JobStoreError::NotFound(id))?;
        if !job.is_leased_by(worker) {
            return Err(JobStoreError::LeaseLost(id));
        }

        let completed = job.complete(now)?;
        write_job(&mut tx, &job, "mark_complete_and_chain").await?;

        let next = match completed.next_stage() {
            Some(_) => {
                let record = JobRecord::successor(&completed, now)?;
                insert_job(&mut *tx, &record, "mark_complete_and_chain").await?;
                Some(record.id)
            }
            None => None,
        };

        commit(tx, "mark_complete_and_chain").await?;
        Ok((completed, next))
    }

    #[instrument(skip(self, message), fields(job_id = %id), err)]
    async fn mark_errored(
        &self,
        id: JobId,
        worker: &str,
        message: &str,
        retryable: bool,
    ) -> Result<JobState, JobStoreError> {
        let now = self.clock.now();
        let policies = self.policies.clone();
        self.with_owned("mark_errored", id, worker, |job| {
            let policy = policies.for_kind(job.kind);
            Ok(job.record_failure(message, retryable, policy, now)?)
        })
        .await
    }

    #[instrument(skip(self, entry), fields(job_id = %id, key = %entry.key), err)]
    async fn append_execution_log(
        &self,
        id: JobId,
        worker: &str,
        entry: ExecutionLogEntry,
    ) -> Result<usize, JobStoreError> {
        let now = self.clock.now();
        self.with_owned("append_execution_log", id, worker, |job| {
            Ok(job.append_log(entry, now)?)
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn release(&self, id: JobId, worker: &str) -> Result<(), JobStoreError> {
        let now = self.clock.now();
        self.with_owned("release", id, worker, |job| Ok(job.release(now)?))
            .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn requeue(&self, id: JobId) -> Result<(), JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, id, false)
            .await?
            .ok_or(JobStoreError::NotFound(id))?;
        job.requeue(self.clock.now())?;
        write_job(&mut tx, &job, "requeue").await?;
        commit(tx, "requeue").await
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(&self, lease_timeout: Duration) -> Result<Vec<ReclaimedJob>, JobStoreError> {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(lease_timeout)
            .map_err(|e| JobStoreError::Storage(format!("invalid lease timeout: {e}")))?;

        let candidates: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM sluice_jobs
            WHERE state = 'processing'
              AND (COALESCE(last_heartbeat_at, started_at) IS NULL
                   OR COALESCE(last_heartbeat_at, started_at) < $1)
            ORDER BY id
            "#,
        )
        .bind(now - timeout)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        let mut reclaimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let id = JobId::from_uuid(id);
            let mut tx = self.begin().await?;
            // A heartbeat may have landed since the scan; re-check under the lock.
            let Some(mut job) = lock_job(&mut tx, id, true).await? else {
                continue;
            };
            if !job.is_stale_at(now, timeout) {
                continue;
            }

            let max_resets = self.policies.for_kind(job.kind).max_resets;
            let state = job.reset(max_resets, now)?;
            write_job(&mut tx, &job, "reclaim_stale").await?;
            commit(tx, "reclaim_stale").await?;

            reclaimed.push(ReclaimedJob {
                id,
                kind: job.kind,
                state,
                num_resets: job.num_resets,
            });
        }
        Ok(reclaimed)
    }

    #[instrument(skip(self), err)]
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sluice_jobs
            WHERE state IN ('completed', 'failed') AND finished_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_terminal_before", e))?;

        Ok(result.rows_affected())
    }
}

async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    id: JobId,
    skip_locked: bool,
) -> Result<Option<JobRecord>, JobStoreError> {
    let lock = if skip_locked {
        "FOR UPDATE SKIP LOCKED"
    } else {
        "FOR UPDATE"
    };
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM sluice_jobs WHERE id = $1 {lock}"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_job", e))?;

    row.map(|r| job_from_row(&r)).transpose()
}

async fn insert_job<'e, E>(executor: E, job: &JobRecord, operation: &str) -> Result<(), JobStoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(&format!(
        r#"
        INSERT INTO sluice_jobs ({JOB_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#
    ))
    .bind(job.id.as_uuid())
    .bind(job.kind.as_str())
    .bind(job.payload_ref.as_str())
    .bind(job.stage.map(|s| s.as_str()))
    .bind(job.predecessor_id.map(|p| *p.as_uuid()))
    .bind(job.state.as_str())
    .bind(job.failure_message.as_deref())
    .bind(job.process_after)
    .bind(job.started_at)
    .bind(job.finished_at)
    .bind(job.num_resets as i32)
    .bind(job.num_failures as i32)
    .bind(job.last_heartbeat_at)
    .bind(job.worker_hostname.as_deref())
    .bind(logs_to_json(&job.execution_logs)?)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

async fn write_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &JobRecord,
    operation: &str,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE sluice_jobs SET
            state = $2,
            failure_message = $3,
            process_after = $4,
            started_at = $5,
            finished_at = $6,
            num_resets = $7,
            num_failures = $8,
            last_heartbeat_at = $9,
            worker_hostname = $10,
            execution_logs = $11,
            updated_at = $12
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.state.as_str())
    .bind(job.failure_message.as_deref())
    .bind(job.process_after)
    .bind(job.started_at)
    .bind(job.finished_at)
    .bind(job.num_resets as i32)
    .bind(job.num_failures as i32)
    .bind(job.last_heartbeat_at)
    .bind(job.worker_hostname.as_deref())
    .bind(logs_to_json(&job.execution_logs)?)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

async fn commit(tx: Transaction<'_, Postgres>, operation: &str) -> Result<(), JobStoreError> {
    tx.commit().await.map_err(|e| map_sqlx_error(operation, e))
}

fn logs_to_json(logs: &[ExecutionLogEntry]) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(logs)
        .map_err(|e| JobStoreError::Storage(format!("failed to encode execution logs: {e}")))
}

fn parse_column<T>(value: &str) -> Result<T, JobStoreError>
where
    T: core::str::FromStr<Err = DomainError>,
{
    value
        .parse()
        .map_err(|e: DomainError| JobStoreError::Storage(format!("corrupt job row: {e}")))
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, JobStoreError> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_job", e);

    let kind: String = row.try_get("kind").map_err(get)?;
    let state: String = row.try_get("state").map_err(get)?;
    let stage: Option<String> = row.try_get("stage").map_err(get)?;
    let predecessor: Option<uuid::Uuid> = row.try_get("predecessor_id").map_err(get)?;
    let logs: serde_json::Value = row.try_get("execution_logs").map_err(get)?;
    let num_resets: i32 = row.try_get("num_resets").map_err(get)?;
    let num_failures: i32 = row.try_get("num_failures").map_err(get)?;

    Ok(JobRecord {
        id: JobId::from_uuid(row.try_get("id").map_err(get)?),
        kind: parse_column(&kind)?,
        payload_ref: PayloadRef::new(row.try_get::<String, _>("payload_ref").map_err(get)?),
        stage: stage.as_deref().map(parse_column::<JobStage>).transpose()?,
        predecessor_id: predecessor.map(JobId::from_uuid),
        state: parse_column(&state)?,
        failure_message: row.try_get("failure_message").map_err(get)?,
        process_after: row.try_get("process_after").map_err(get)?,
        started_at: row.try_get("started_at").map_err(get)?,
        finished_at: row.try_get("finished_at").map_err(get)?,
        num_resets: num_resets.max(0) as u32,
        num_failures: num_failures.max(0) as u32,
        last_heartbeat_at: row.try_get("last_heartbeat_at").map_err(get)?,
        worker_hostname: row.try_get("worker_hostname").map_err(get)?,
        execution_logs: serde_json::from_value(logs)
            .map_err(|e| JobStoreError::Storage(format!("corrupt execution logs: {e}")))?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}

/// Map a sqlx error; connectivity problems become `Unavailable`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => JobStoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
