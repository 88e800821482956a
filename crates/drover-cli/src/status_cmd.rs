//! `drover status`: task counts, runners, health and adaptations, read
//! straight from the store.

use anyhow::Result;
use sqlx::SqlitePool;

use drover_db::models::TaskStatus;
use drover_db::queries::{adaptations, health, runners, tasks as task_db};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Run the status command. `recent` bounds the task, health and
/// adaptation listings.
pub async fn run_status(pool: &SqlitePool, recent: i64) -> Result<()> {
    let counts = task_db::task_counts(pool).await?;
    println!("Tasks: {} total", counts.total);
    println!(
        "  pending={} in_progress={} completed={} failed={}",
        counts.pending, counts.in_progress, counts.completed, counts.failed,
    );
    println!();

    let active = task_db::list_tasks_by_status(pool, TaskStatus::InProgress).await?;
    if !active.is_empty() {
        println!("In progress:");
        for task in &active {
            let started = task
                .started_at
                .map(|t| t.format(TIME_FORMAT).to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<40} {:<16} {:<12} since {started}",
                truncate(&task.title, 40),
                task.assigned_agent.as_deref().unwrap_or("-"),
                task.assigned_runner.as_deref().unwrap_or("-"),
            );
        }
        println!();
    }

    let failed = task_db::list_tasks_by_status(pool, TaskStatus::Failed).await?;
    if !failed.is_empty() {
        println!("Failed:");
        for task in failed.iter().take(recent.max(0) as usize) {
            let kind = task.failure_kind.map(|k| k.as_str()).unwrap_or("-");
            let budget = if task.is_terminal() { "exhausted" } else { "retryable" };
            println!(
                "  {:<40} {:<20} attempts {}/{} ({budget})",
                truncate(&task.title, 40),
                kind,
                task.attempts,
                task.max_attempts,
            );
            if let Some(error) = &task.error {
                println!("      {}", truncate(error, 100));
            }
        }
        println!();
    }

    let fleet = runners::list_runners(pool).await?;
    println!("Runners: {}", fleet.len());
    if !fleet.is_empty() {
        println!(
            "  {:<14} {:<10} {:<5} {:<8} {:>9} {:>10}",
            "ID", "PROFILE", "GPU", "STATUS", "COMPLETED", "RECOVERIES"
        );
        for runner in &fleet {
            let gpu = runner
                .gpu_id
                .map(|g| g.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<14} {:<10} {:<5} {:<8} {:>9} {:>10}",
                runner.id,
                runner.profile.as_str(),
                gpu,
                runner.status.as_str(),
                runner.tasks_completed,
                runner.recovery_attempts,
            );
        }
    }
    println!();

    let latest = health::latest_per_component(pool).await?;
    if latest.is_empty() {
        println!("Health: no checks recorded yet");
    } else {
        println!("Health:");
        for record in &latest {
            let state = if record.healthy { "healthy" } else { "UNHEALTHY" };
            print!(
                "  {:<16} {:<10} {}",
                record.component,
                state,
                record.recorded_at.format(TIME_FORMAT)
            );
            match &record.detail {
                Some(detail) => println!("  {}", truncate(detail, 80)),
                None => println!(),
            }
        }
    }

    let entries = adaptations::list_recent(pool, recent).await?;
    if !entries.is_empty() {
        println!();
        println!("Adaptations (newest first):");
        for entry in &entries {
            println!(
                "  {} {:<12} {}: {}",
                entry.recorded_at.format(TIME_FORMAT),
                entry.kind,
                entry.action,
                entry.reason
            );
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        assert_eq!(truncate("ééééé", 4), "é...");
    }

    #[tokio::test]
    async fn status_reads_an_empty_store() {
        let db = drover_test_utils::create_test_db().await;
        run_status(&db.pool, 10).await.unwrap();
        db.teardown().await;
    }
}
