//! Database schema bootstrap.

use sqlx::PgPool;
use tracing::info;

const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_jobs", include_str!("../migrations/0001_jobs.sql")),
    ("0002_ranking", include_str!("../migrations/0002_ranking.sql")),
];

/// Apply the bundled schema. Every statement is idempotent, so this runs on
/// each worker start.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for (name, sql) in MIGRATIONS {
        sqlx::raw_sql(sql).execute(pool).await?;
        info!(migration = *name, "schema applied");
    }
    Ok(())
}
