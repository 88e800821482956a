//! Execution engine tests: agent outcomes, mutation guarding and the
//! execution log.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use drover_db::models::{
    ExecutionOutcome, Priority, ProfileKind, Runner, RunnerStatus, SourceKind, Task,
};
use drover_db::queries::{execution_log, tasks as task_db};
use drover_test_utils::create_test_db;

use drover_core::agent::{
    Agent, AgentOutput, AgentRegistry, AgentRequest, Capability, Mutation,
};
use drover_core::engine::{EngineConfig, ExecutionEngine};
use drover_core::error::{AgentError, OrchestrationError, ValidationError};

/// Writes `content` to `path`, or hangs until cancelled when `path` is
/// `None`.
struct Writer {
    path: Option<PathBuf>,
    content: String,
}

#[async_trait]
impl Agent for Writer {
    fn name(&self) -> &str {
        "writer"
    }

    fn capability(&self) -> Capability {
        Capability::CodeGeneration
    }

    fn profile(&self) -> ProfileKind {
        ProfileKind::Light
    }

    async fn execute(
        &self,
        _request: &AgentRequest,
        cancel: CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        match &self.path {
            Some(path) => Ok(AgentOutput::succeeded("ok", Duration::ZERO).with_mutation(
                Mutation {
                    path: path.clone(),
                    content: self.content.clone(),
                },
            )),
            None => {
                cancel.cancelled().await;
                Err(AgentError::Cancelled)
            }
        }
    }
}

fn runner() -> Runner {
    Runner {
        id: "light-0".to_string(),
        profile: ProfileKind::Light,
        gpu_id: None,
        status: RunnerStatus::Running,
        current_task: None,
        tasks_completed: 0,
        recovery_attempts: 0,
        updated_at: Utc::now(),
    }
}

async fn task_for(pool: &sqlx::SqlitePool, title: &str, agent: &str) -> Task {
    let task = task_db::insert_task_if_new(
        pool,
        &task_db::NewTask {
            title,
            description: "",
            source_id: "test",
            source_kind: SourceKind::Manual,
            priority: Priority::High,
            dedup_key: title,
            max_attempts: 3,
        },
    )
    .await
    .unwrap()
    .unwrap();
    task_db::set_classification(pool, task.id, agent, "pattern", 0.9)
        .await
        .unwrap();
    task_db::get_task(pool, task.id).await.unwrap().unwrap()
}

fn engine(
    pool: &sqlx::SqlitePool,
    workspace: &std::path::Path,
    agent: Option<Writer>,
    task_timeout_secs: u64,
) -> ExecutionEngine {
    let mut agents = AgentRegistry::new();
    if let Some(agent) = agent {
        agents.register(agent);
    }
    ExecutionEngine::new(
        pool.clone(),
        agents,
        &EngineConfig {
            workspace_root: workspace.to_path_buf(),
            backup_dir: PathBuf::from(".drover/backups"),
            deny_patterns: vec!["do-not-ship".to_string()],
            task_timeout_secs,
        },
    )
}

#[tokio::test]
async fn writes_new_file_and_logs_success() {
    let db = create_test_db().await;
    let workspace = tempfile::TempDir::new().unwrap();
    let task = task_for(&db.pool, "create notes", "writer").await;
    let engine = engine(
        &db.pool,
        workspace.path(),
        Some(Writer {
            path: Some(PathBuf::from("docs/notes.md")),
            content: "# Notes\n".to_string(),
        }),
        60,
    );

    let report = engine
        .execute(&task, &runner(), CancellationToken::new())
        .await
        .unwrap();
    assert!(report.succeeded());
    assert_eq!(report.outcome(), ExecutionOutcome::Success);
    let applied = report.applied.unwrap();
    assert!(applied.backup.is_none());
    assert_eq!(
        std::fs::read_to_string(workspace.path().join("docs/notes.md")).unwrap(),
        "# Notes\n"
    );

    let log = execution_log::list_for_task(&db.pool, task.id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, ExecutionOutcome::Success);
    assert_eq!(log[0].agent, "writer");
    assert_eq!(log[0].runner_id.as_deref(), Some("light-0"));
    assert!(log[0].detail.as_deref().unwrap().starts_with("created"));

    db.teardown().await;
}

#[tokio::test]
async fn rejects_escape_and_extra_deny_patterns() {
    let db = create_test_db().await;
    let workspace = tempfile::TempDir::new().unwrap();

    let escape = task_for(&db.pool, "escape", "writer").await;
    let report = engine(
        &db.pool,
        workspace.path(),
        Some(Writer {
            path: Some(PathBuf::from("../outside.txt")),
            content: "hi".to_string(),
        }),
        60,
    )
    .execute(&escape, &runner(), CancellationToken::new())
    .await
    .unwrap();
    assert!(matches!(
        report.error,
        Some(OrchestrationError::ValidationFailure {
            source: ValidationError::OutsideWorkspace { .. },
            ..
        })
    ));
    assert_eq!(report.outcome(), ExecutionOutcome::ValidationFailure);

    let target = workspace.path().join("release.txt");
    std::fs::write(&target, "v1").unwrap();
    let denied = task_for(&db.pool, "denied", "writer").await;
    let report = engine(
        &db.pool,
        workspace.path(),
        Some(Writer {
            path: Some(PathBuf::from("release.txt")),
            content: "v2 DO-NOT-SHIP".to_string(),
        }),
        60,
    )
    .execute(&denied, &runner(), CancellationToken::new())
    .await
    .unwrap();
    assert!(matches!(
        report.error,
        Some(OrchestrationError::ValidationFailure {
            source: ValidationError::DenyListed { .. },
            ..
        })
    ));
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "v1");

    db.teardown().await;
}

#[tokio::test]
async fn backups_cannot_be_overwritten() {
    let db = create_test_db().await;
    let workspace = tempfile::TempDir::new().unwrap();
    let backups = workspace.path().join(".drover/backups");
    std::fs::create_dir_all(&backups).unwrap();
    let saved = backups.join("lib.rs.bak");
    std::fs::write(&saved, "fn old() {}").unwrap();

    let task = task_for(&db.pool, "rewrite backup", "writer").await;
    let report = engine(
        &db.pool,
        workspace.path(),
        Some(Writer {
            path: Some(PathBuf::from(".drover/backups/lib.rs.bak")),
            content: "fn new() {}".to_string(),
        }),
        60,
    )
    .execute(&task, &runner(), CancellationToken::new())
    .await
    .unwrap();

    assert!(matches!(
        report.error,
        Some(OrchestrationError::ValidationFailure {
            source: ValidationError::Protected { .. },
            ..
        })
    ));
    assert_eq!(report.outcome(), ExecutionOutcome::ValidationFailure);
    assert_eq!(std::fs::read_to_string(&saved).unwrap(), "fn old() {}");

    db.teardown().await;
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let db = create_test_db().await;
    let workspace = tempfile::TempDir::new().unwrap();
    let task = task_for(&db.pool, "bad json", "writer").await;

    let report = engine(
        &db.pool,
        workspace.path(),
        Some(Writer {
            path: Some(PathBuf::from("settings.json")),
            content: "{\"a\": ".to_string(),
        }),
        60,
    )
    .execute(&task, &runner(), CancellationToken::new())
    .await
    .unwrap();

    assert!(matches!(
        report.error,
        Some(OrchestrationError::ValidationFailure {
            source: ValidationError::Malformed { .. },
            ..
        })
    ));
    assert!(!workspace.path().join("settings.json").exists());

    db.teardown().await;
}

#[tokio::test]
async fn unknown_agent_is_an_execution_error() {
    let db = create_test_db().await;
    let workspace = tempfile::TempDir::new().unwrap();
    let task = task_for(&db.pool, "orphan", "nobody").await;

    let report = engine(&db.pool, workspace.path(), None, 60)
        .execute(&task, &runner(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome(), ExecutionOutcome::ExecutionError);
    assert!(report.error.unwrap().to_string().contains("nobody"));

    db.teardown().await;
}

#[tokio::test]
async fn cancellation_and_timeout_map_to_their_errors() {
    let db = create_test_db().await;
    let workspace = tempfile::TempDir::new().unwrap();

    let hang = || Writer {
        path: None,
        content: String::new(),
    };

    let cancelled = task_for(&db.pool, "cancel me", "writer").await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = engine(&db.pool, workspace.path(), Some(hang()), 60)
        .execute(&cancelled, &runner(), cancel)
        .await
        .unwrap();
    assert!(matches!(report.error, Some(OrchestrationError::Cancelled { .. })));
    assert_eq!(report.outcome(), ExecutionOutcome::Cancelled);

    let slow = task_for(&db.pool, "too slow", "writer").await;
    let report = engine(&db.pool, workspace.path(), Some(hang()), 1)
        .execute(&slow, &runner(), CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(report.error, Some(OrchestrationError::ExecutionError { .. })));
    assert!(report.error.unwrap().to_string().contains("timed out"));

    db.teardown().await;
}
