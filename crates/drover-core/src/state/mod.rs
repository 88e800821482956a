//! Task state machine transitions.
//!
//! Every transition is a compare-and-set against the status the caller
//! observed. Each method returns `Ok(false)` when another actor moved the
//! task first; `Err` is reserved for storage failures.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use drover_db::models::{FailureKind, Task, TaskStatus};
use drover_db::queries::tasks as db;

/// The task state machine.
///
/// ```text
/// pending     -> in_progress   (assignment)
/// in_progress -> completed
/// in_progress -> failed
/// in_progress -> pending       (stale reset, runner fault)
/// failed      -> pending       (retry, attempts < max_attempts)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Pending)
                | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }

    /// `pending -> in_progress` on `runner_id`. Returns `false` when the
    /// task was no longer pending.
    pub async fn start(pool: &SqlitePool, task_id: Uuid, runner_id: &str) -> Result<bool> {
        let rows = db::start_task(pool, task_id, runner_id, Utc::now())
            .await
            .with_context(|| format!("failed to start task {task_id}"))?;
        Ok(rows > 0)
    }

    pub async fn complete(pool: &SqlitePool, task_id: Uuid) -> Result<bool> {
        let rows = db::complete_task(pool, task_id, Utc::now()).await?;
        if rows == 0 {
            Self::warn_lost(pool, task_id, TaskStatus::Completed).await?;
        }
        Ok(rows > 0)
    }

    pub async fn fail(
        pool: &SqlitePool,
        task_id: Uuid,
        kind: FailureKind,
        error: &str,
    ) -> Result<bool> {
        let rows = db::fail_task(pool, task_id, kind, error, Utc::now()).await?;
        if rows == 0 {
            Self::warn_lost(pool, task_id, TaskStatus::Failed).await?;
        }
        Ok(rows > 0)
    }

    /// Return an in-progress task to the queue, consuming one attempt.
    pub async fn requeue(
        pool: &SqlitePool,
        task_id: Uuid,
        kind: FailureKind,
        reason: &str,
    ) -> Result<bool> {
        let rows = db::requeue_task(pool, task_id, kind, reason, None).await?;
        if rows == 0 {
            Self::warn_lost(pool, task_id, TaskStatus::Pending).await?;
        }
        Ok(rows > 0)
    }

    /// `failed -> pending` when the task still has attempts left.
    ///
    /// Returns `false` once the budget is spent or when the row changed
    /// since `task` was read.
    pub async fn retry(pool: &SqlitePool, task: &Task) -> Result<bool> {
        if task.status != TaskStatus::Failed {
            bail!(
                "cannot retry task {}: current status is {}, expected failed",
                task.id,
                task.status
            );
        }
        if task.attempts >= task.max_attempts {
            return Ok(false);
        }

        let rows = db::retry_task(pool, task.id, task.attempts).await?;
        if rows == 0 {
            Self::warn_lost(pool, task.id, TaskStatus::Pending).await?;
            return Ok(false);
        }
        info!(task_id = %task.id, attempts = task.attempts + 1, "retrying failed task");
        Ok(true)
    }

    /// Requeue every in-progress task that started more than `threshold`
    /// ago. Running it twice in a row changes nothing the second time.
    pub async fn sweep_stale(pool: &SqlitePool, threshold: Duration) -> Result<Vec<Uuid>> {
        let threshold = chrono::Duration::from_std(threshold)
            .context("stale threshold out of range")?;
        let cutoff = Utc::now() - threshold;

        let mut reset = Vec::new();
        for task in db::list_tasks_by_status(pool, TaskStatus::InProgress).await? {
            let Some(started_at) = task.started_at else {
                continue;
            };
            if started_at >= cutoff {
                continue;
            }
            let reason = format!("stale: in progress since {}", started_at.to_rfc3339());
            let rows =
                db::requeue_task(pool, task.id, FailureKind::Stale, &reason, Some(cutoff)).await?;
            if rows > 0 {
                warn!(task_id = %task.id, started_at = %started_at, "reset stale task");
                reset.push(task.id);
            }
        }

        if !reset.is_empty() {
            info!(count = reset.len(), "stale sweep requeued tasks");
        }
        Ok(reset)
    }

    async fn warn_lost(pool: &SqlitePool, task_id: Uuid, to: TaskStatus) -> Result<()> {
        match db::get_task(pool, task_id).await? {
            None => bail!("task {} not found", task_id),
            Some(t) => {
                warn!(
                    task_id = %task_id,
                    status = %t.status,
                    to = %to,
                    "optimistic lock failed: task changed before transition"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph() {
        use TaskStatus::*;
        assert!(TaskStateMachine::is_valid_transition(Pending, InProgress));
        assert!(TaskStateMachine::is_valid_transition(InProgress, Completed));
        assert!(TaskStateMachine::is_valid_transition(InProgress, Failed));
        assert!(TaskStateMachine::is_valid_transition(InProgress, Pending));
        assert!(TaskStateMachine::is_valid_transition(Failed, Pending));

        assert!(!TaskStateMachine::is_valid_transition(Pending, Completed));
        assert!(!TaskStateMachine::is_valid_transition(Completed, Pending));
        assert!(!TaskStateMachine::is_valid_transition(Failed, InProgress));
        assert!(!TaskStateMachine::is_valid_transition(Pending, Failed));
    }
}
