//! Query functions for the `adaptations` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::AdaptationEntry;

/// Most recent entries retained.
pub const MAX_ENTRIES: i64 = 50;

/// Append an entry and drop everything older than the newest
/// [`MAX_ENTRIES`].
pub async fn append(
    pool: &SqlitePool,
    kind: &str,
    reason: &str,
    action: &str,
    at: DateTime<Utc>,
) -> Result<AdaptationEntry> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let entry = sqlx::query_as::<_, AdaptationEntry>(
        "INSERT INTO adaptations (kind, reason, action, recorded_at) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(kind)
    .bind(reason)
    .bind(action)
    .bind(at)
    .fetch_one(&mut *tx)
    .await
    .with_context(|| format!("failed to append {kind} adaptation"))?;

    sqlx::query(
        "DELETE FROM adaptations \
         WHERE id NOT IN (SELECT id FROM adaptations ORDER BY id DESC LIMIT $1)",
    )
    .bind(MAX_ENTRIES)
    .execute(&mut *tx)
    .await
    .context("failed to trim adaptations")?;

    tx.commit().await.context("failed to commit adaptation")?;
    Ok(entry)
}

/// Entries newest first.
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<AdaptationEntry>> {
    let rows = sqlx::query_as::<_, AdaptationEntry>(
        "SELECT * FROM adaptations ORDER BY id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list adaptations")?;

    Ok(rows)
}
