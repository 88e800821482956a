//! Query functions for the rolling `health_records` history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::HealthRecord;

/// Append a health observation and trim the history to `keep` rows.
pub async fn record(
    pool: &SqlitePool,
    component: &str,
    healthy: bool,
    detail: Option<&str>,
    at: DateTime<Utc>,
    keep: i64,
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    sqlx::query(
        "INSERT INTO health_records (component, healthy, detail, recorded_at) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(component)
    .bind(healthy)
    .bind(detail)
    .bind(at)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("failed to record health of {component}"))?;

    sqlx::query(
        "DELETE FROM health_records \
         WHERE id NOT IN (SELECT id FROM health_records ORDER BY id DESC LIMIT $1)",
    )
    .bind(keep)
    .execute(&mut *tx)
    .await
    .context("failed to trim health history")?;

    tx.commit().await.context("failed to commit health record")?;
    Ok(())
}

/// The most recent `limit` records, newest first.
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<HealthRecord>> {
    let rows = sqlx::query_as::<_, HealthRecord>(
        "SELECT * FROM health_records ORDER BY id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list health records")?;

    Ok(rows)
}

/// The latest record per component, ordered by component name.
pub async fn latest_per_component(pool: &SqlitePool) -> Result<Vec<HealthRecord>> {
    let rows = sqlx::query_as::<_, HealthRecord>(
        "SELECT h.* FROM health_records h \
         JOIN (SELECT component, MAX(id) AS max_id FROM health_records GROUP BY component) latest \
           ON latest.max_id = h.id \
         ORDER BY h.component ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list latest health per component")?;

    Ok(rows)
}

/// Total number of stored records.
pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM health_records")
        .fetch_one(pool)
        .await
        .context("failed to count health records")?;
    Ok(row.0)
}
