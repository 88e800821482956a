//! Query functions for the `tasks` table and its append-only
//! `task_transitions` log.
//!
//! Every status change is a compare-and-swap: the UPDATE's WHERE clause
//! pins the expected current status, and the transition row is written in
//! the same transaction. A return value of `0` rows means another writer
//! got there first (or the task does not exist).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::models::{FailureKind, Priority, SourceKind, Task, TaskStatus, TaskTransition};

/// SQL fragment ordering tasks by urgency, then discovery order.
const PRIORITY_ORDER: &str = "CASE priority \
     WHEN 'critical' THEN 0 \
     WHEN 'high' THEN 1 \
     WHEN 'medium' THEN 2 \
     ELSE 3 END, discovery_seq ASC";

/// Parameters for inserting a newly discovered task.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub source_id: &'a str,
    pub source_kind: SourceKind,
    pub priority: Priority,
    pub dedup_key: &'a str,
    pub max_attempts: i32,
}

/// Append one row to the transition log.
async fn log_transition(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    from: Option<TaskStatus>,
    to: TaskStatus,
    runner_id: Option<&str>,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_transitions \
             (task_id, from_status, to_status, attempts, runner_id, reason, recorded_at) \
         VALUES ($1, $2, $3, (SELECT attempts FROM tasks WHERE id = $1), $4, $5, $6)",
    )
    .bind(task_id)
    .bind(from)
    .bind(to)
    .bind(runner_id)
    .bind(reason)
    .bind(at)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to log transition for task {task_id}"))?;
    Ok(())
}

/// Insert a task unless one with the same `dedup_key` already exists.
///
/// Returns the inserted row, or `None` when the key was already present
/// (regardless of that task's status).
pub async fn insert_task_if_new(pool: &SqlitePool, new: &NewTask<'_>) -> Result<Option<Task>> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
             (id, title, description, source_id, source_kind, priority, status, \
              dedup_key, discovery_seq, attempts, max_attempts, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, \
                 (SELECT COALESCE(MAX(discovery_seq), 0) + 1 FROM tasks), \
                 0, $8, $9) \
         ON CONFLICT (dedup_key) DO NOTHING \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.title)
    .bind(new.description)
    .bind(new.source_id)
    .bind(new.source_kind)
    .bind(new.priority)
    .bind(new.dedup_key)
    .bind(new.max_attempts)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await
    .with_context(|| format!("failed to insert task {:?}", new.title))?;

    if let Some(ref task) = task {
        log_transition(
            &mut tx,
            task.id,
            None,
            TaskStatus::Pending,
            None,
            Some("discovered"),
            now,
        )
        .await?;
    }

    tx.commit().await.context("failed to commit task insert")?;
    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a task by its deduplication key.
pub async fn get_task_by_dedup_key(pool: &SqlitePool, dedup_key: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE dedup_key = $1")
        .bind(dedup_key)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task by dedup key")?;

    Ok(task)
}

/// List every task in discovery order.
pub async fn list_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY discovery_seq ASC")
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    Ok(tasks)
}

/// List tasks with the given status in discovery order.
pub async fn list_tasks_by_status(pool: &SqlitePool, status: TaskStatus) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = $1 ORDER BY discovery_seq ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list {status} tasks"))?;

    Ok(tasks)
}

/// List pending tasks by priority, then discovery order.
pub async fn list_pending_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let query = format!("SELECT * FROM tasks WHERE status = 'pending' ORDER BY {PRIORITY_ORDER}");
    let tasks = sqlx::query_as::<_, Task>(&query)
        .fetch_all(pool)
        .await
        .context("failed to list pending tasks")?;

    Ok(tasks)
}

/// List failed tasks that still have retry budget.
pub async fn list_retryable_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let query = format!(
        "SELECT * FROM tasks \
         WHERE status = 'failed' AND attempts < max_attempts \
         ORDER BY {PRIORITY_ORDER}"
    );
    let tasks = sqlx::query_as::<_, Task>(&query)
        .fetch_all(pool)
        .await
        .context("failed to list retryable tasks")?;

    Ok(tasks)
}

/// Record the classifier's decision on a pending task.
pub async fn set_classification(
    pool: &SqlitePool,
    task_id: Uuid,
    agent: &str,
    method: &str,
    confidence: f64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET assigned_agent = $1, classification_method = $2, classification_confidence = $3 \
         WHERE id = $4 AND status = 'pending'",
    )
    .bind(agent)
    .bind(method)
    .bind(confidence)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to record classification")?;

    Ok(result.rows_affected())
}

/// `pending -> in_progress`: bind the task to a runner and stamp
/// `started_at`.
pub async fn start_task(
    pool: &SqlitePool,
    task_id: Uuid,
    runner_id: &str,
    started_at: DateTime<Utc>,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'in_progress', \
             assigned_runner = $1, \
             started_at = $2, \
             completed_at = NULL \
         WHERE id = $3 AND status = 'pending'",
    )
    .bind(runner_id)
    .bind(started_at)
    .bind(task_id)
    .execute(&mut *tx)
    .await
    .context("failed to start task")?;

    if result.rows_affected() > 0 {
        log_transition(
            &mut tx,
            task_id,
            Some(TaskStatus::Pending),
            TaskStatus::InProgress,
            Some(runner_id),
            None,
            started_at,
        )
        .await?;
    }

    tx.commit().await.context("failed to commit task start")?;
    Ok(result.rows_affected())
}

/// `in_progress -> completed`.
pub async fn complete_task(
    pool: &SqlitePool,
    task_id: Uuid,
    completed_at: DateTime<Utc>,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', completed_at = $1, failure_kind = NULL, error = NULL \
         WHERE id = $2 AND status = 'in_progress'",
    )
    .bind(completed_at)
    .bind(task_id)
    .execute(&mut *tx)
    .await
    .context("failed to complete task")?;

    if result.rows_affected() > 0 {
        log_transition(
            &mut tx,
            task_id,
            Some(TaskStatus::InProgress),
            TaskStatus::Completed,
            None,
            None,
            completed_at,
        )
        .await?;
    }

    tx.commit().await.context("failed to commit task completion")?;
    Ok(result.rows_affected())
}

/// `in_progress -> failed`, recording the failure category and message.
pub async fn fail_task(
    pool: &SqlitePool,
    task_id: Uuid,
    kind: FailureKind,
    error: &str,
    completed_at: DateTime<Utc>,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', completed_at = $1, failure_kind = $2, error = $3 \
         WHERE id = $4 AND status = 'in_progress'",
    )
    .bind(completed_at)
    .bind(kind)
    .bind(error)
    .bind(task_id)
    .execute(&mut *tx)
    .await
    .context("failed to fail task")?;

    if result.rows_affected() > 0 {
        log_transition(
            &mut tx,
            task_id,
            Some(TaskStatus::InProgress),
            TaskStatus::Failed,
            None,
            Some(kind.as_str()),
            completed_at,
        )
        .await?;
    }

    tx.commit().await.context("failed to commit task failure")?;
    Ok(result.rows_affected())
}

/// `in_progress -> pending` with `attempts + 1`.
///
/// Used by stale-task reset and runner-fault requeue. When
/// `started_before` is set, only tasks whose `started_at` is strictly
/// earlier than it are requeued, which makes the stale sweep safe to race
/// with a task that was restarted in between.
pub async fn requeue_task(
    pool: &SqlitePool,
    task_id: Uuid,
    kind: FailureKind,
    reason: &str,
    started_before: Option<DateTime<Utc>>,
) -> Result<u64> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             attempts = attempts + 1, \
             assigned_runner = NULL, \
             started_at = NULL, \
             completed_at = NULL, \
             failure_kind = $1, \
             error = $2 \
         WHERE id = $3 AND status = 'in_progress' \
           AND ($4 IS NULL OR started_at < $4)",
    )
    .bind(kind)
    .bind(reason)
    .bind(task_id)
    .bind(started_before)
    .execute(&mut *tx)
    .await
    .context("failed to requeue task")?;

    if result.rows_affected() > 0 {
        log_transition(
            &mut tx,
            task_id,
            Some(TaskStatus::InProgress),
            TaskStatus::Pending,
            None,
            Some(reason),
            now,
        )
        .await?;
    }

    tx.commit().await.context("failed to commit task requeue")?;
    Ok(result.rows_affected())
}

/// `failed -> pending` with `attempts + 1`, guarded on the attempt count the
/// caller observed and on the retry budget.
pub async fn retry_task(pool: &SqlitePool, task_id: Uuid, current_attempts: i32) -> Result<u64> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             attempts = attempts + 1, \
             assigned_runner = NULL, \
             started_at = NULL, \
             completed_at = NULL \
         WHERE id = $1 AND status = 'failed' \
           AND attempts = $2 AND attempts < max_attempts",
    )
    .bind(task_id)
    .bind(current_attempts)
    .execute(&mut *tx)
    .await
    .context("failed to retry task")?;

    if result.rows_affected() > 0 {
        log_transition(
            &mut tx,
            task_id,
            Some(TaskStatus::Failed),
            TaskStatus::Pending,
            None,
            Some("retry"),
            now,
        )
        .await?;
    }

    tx.commit().await.context("failed to commit task retry")?;
    Ok(result.rows_affected())
}

/// Status counts across all tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// Count tasks by status.
pub async fn task_counts(pool: &SqlitePool) -> Result<TaskCounts> {
    let rows: Vec<(TaskStatus, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to count tasks")?;

    let mut counts = TaskCounts::default();
    for (status, count) in rows {
        match status {
            TaskStatus::Pending => counts.pending = count,
            TaskStatus::InProgress => counts.in_progress = count,
            TaskStatus::Completed => counts.completed = count,
            TaskStatus::Failed => counts.failed = count,
        }
        counts.total += count;
    }
    Ok(counts)
}

/// The transition log for one task, oldest first.
pub async fn list_transitions(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<TaskTransition>> {
    let rows = sqlx::query_as::<_, TaskTransition>(
        "SELECT * FROM task_transitions WHERE task_id = $1 ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list transitions for task {task_id}"))?;

    Ok(rows)
}
