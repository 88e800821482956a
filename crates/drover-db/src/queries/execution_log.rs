//! Query functions for the durable `execution_log` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{ExecutionOutcome, ExecutionRecord};

/// Parameters for appending an execution record.
#[derive(Debug, Clone)]
pub struct NewExecutionRecord<'a> {
    pub task_id: Uuid,
    pub agent: &'a str,
    pub runner_id: Option<&'a str>,
    pub attempt: i32,
    pub outcome: ExecutionOutcome,
    pub duration_ms: i64,
    pub detail: Option<&'a str>,
}

/// Append one execution record.
pub async fn append(pool: &SqlitePool, new: &NewExecutionRecord<'_>) -> Result<ExecutionRecord> {
    let record = sqlx::query_as::<_, ExecutionRecord>(
        "INSERT INTO execution_log \
             (task_id, agent, runner_id, attempt, outcome, duration_ms, detail, recorded_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.agent)
    .bind(new.runner_id)
    .bind(new.attempt)
    .bind(new.outcome)
    .bind(new.duration_ms)
    .bind(new.detail)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to append execution record for task {} ({})",
            new.task_id, new.outcome
        )
    })?;

    Ok(record)
}

/// All execution records for a task, oldest first.
pub async fn list_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<ExecutionRecord>> {
    let records = sqlx::query_as::<_, ExecutionRecord>(
        "SELECT * FROM execution_log WHERE task_id = $1 ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list execution records for task {task_id}"))?;

    Ok(records)
}

/// The most recent `limit` records across all tasks, newest first.
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<ExecutionRecord>> {
    let records = sqlx::query_as::<_, ExecutionRecord>(
        "SELECT * FROM execution_log ORDER BY id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent execution records")?;

    Ok(records)
}
