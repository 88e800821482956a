//! Query functions for the `runners` table.
//!
//! The scheduler owns the live registry in memory; this table is its
//! durable mirror, written on every runner mutation so `status` can report
//! it from another process.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::Runner;

/// Replace the whole registry with `runners` in one transaction.
///
/// Called once at startup after capacity planning: instances from a
/// previous process do not survive a restart.
pub async fn replace_runners(pool: &SqlitePool, runners: &[Runner]) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    sqlx::query("DELETE FROM runners")
        .execute(&mut *tx)
        .await
        .context("failed to clear runners")?;

    for runner in runners {
        sqlx::query(
            "INSERT INTO runners \
                 (id, profile, gpu_id, status, current_task, tasks_completed, \
                  recovery_attempts, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&runner.id)
        .bind(runner.profile)
        .bind(runner.gpu_id)
        .bind(runner.status)
        .bind(runner.current_task)
        .bind(runner.tasks_completed)
        .bind(runner.recovery_attempts)
        .bind(runner.updated_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert runner {}", runner.id))?;
    }

    tx.commit().await.context("failed to commit runner registry")?;
    Ok(())
}

/// Write the mutable fields of one runner.
pub async fn update_runner(pool: &SqlitePool, runner: &Runner) -> Result<()> {
    let result = sqlx::query(
        "UPDATE runners \
         SET status = $1, current_task = $2, tasks_completed = $3, \
             recovery_attempts = $4, updated_at = $5 \
         WHERE id = $6",
    )
    .bind(runner.status)
    .bind(runner.current_task)
    .bind(runner.tasks_completed)
    .bind(runner.recovery_attempts)
    .bind(Utc::now())
    .bind(&runner.id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to update runner {}", runner.id))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("runner {} not found", runner.id);
    }
    Ok(())
}

/// List every runner ordered by id.
pub async fn list_runners(pool: &SqlitePool) -> Result<Vec<Runner>> {
    let runners = sqlx::query_as::<_, Runner>("SELECT * FROM runners ORDER BY id ASC")
        .fetch_all(pool)
        .await
        .context("failed to list runners")?;

    Ok(runners)
}
