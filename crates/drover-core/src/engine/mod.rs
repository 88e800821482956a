//! Execution engine: runs a task on its classified agent, guards any
//! proposed file mutation, and appends the attempt to the execution log.
//!
//! The engine never changes task status itself; it returns an
//! [`ExecutionReport`] and the orchestrator applies the matching
//! transition.

pub mod apply;
pub mod guard;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use drover_db::models::{ExecutionOutcome, Runner, Task};
use drover_db::queries::execution_log::{self, NewExecutionRecord};

use crate::agent::{AgentRegistry, AgentRequest};
use crate::error::{AgentError, OrchestrationError};

pub use apply::{AppliedMutation, apply_mutation, sha256_hex};
pub use guard::{BUILTIN_DENY_LIST, ContentFormat, MutationGuard, check_syntax};

/// Mutation safety settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Mutations must land under this directory.
    pub workspace_root: PathBuf,
    /// Where previous file contents are copied before a write.
    pub backup_dir: PathBuf,
    /// Patterns rejected in addition to the built-in deny-list.
    pub deny_patterns: Vec<String>,
    /// Upper bound on one agent execution, on top of the agent's own limit.
    pub task_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            backup_dir: PathBuf::from(".drover/backups"),
            deny_patterns: Vec::new(),
            task_timeout_secs: 3600,
        }
    }
}

/// Outcome of one execution attempt.
#[derive(Debug)]
pub struct ExecutionReport {
    pub task_id: uuid::Uuid,
    pub agent: String,
    pub runner_id: String,
    pub duration: Duration,
    pub output: String,
    pub applied: Option<AppliedMutation>,
    /// `None` on success.
    pub error: Option<OrchestrationError>,
}

impl ExecutionReport {
    pub fn outcome(&self) -> ExecutionOutcome {
        match self.error.as_ref().and_then(|e| e.failure_kind()) {
            None => ExecutionOutcome::Success,
            Some(kind) => kind.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct ExecutionEngine {
    pool: SqlitePool,
    agents: AgentRegistry,
    guard: MutationGuard,
    workspace_root: PathBuf,
    backup_dir: PathBuf,
    task_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(pool: SqlitePool, agents: AgentRegistry, config: &EngineConfig) -> Self {
        let guard = MutationGuard::new(&config.workspace_root, &config.deny_patterns);
        let workspace_root = guard.root().to_path_buf();
        let backup_dir = if config.backup_dir.is_absolute() {
            config.backup_dir.clone()
        } else {
            workspace_root.join(&config.backup_dir)
        };
        let guard = guard.with_protected(&backup_dir);
        Self {
            pool,
            agents,
            guard,
            workspace_root,
            backup_dir,
            task_timeout: Duration::from_secs(config.task_timeout_secs.max(1)),
        }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Run `task` on `runner`. Only storage failures are returned as `Err`.
    pub async fn execute(
        &self,
        task: &Task,
        runner: &Runner,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport> {
        let start = Instant::now();
        let agent_name = task.assigned_agent.clone().unwrap_or_default();

        let mut report = ExecutionReport {
            task_id: task.id,
            agent: agent_name.clone(),
            runner_id: runner.id.clone(),
            duration: Duration::ZERO,
            output: String::new(),
            applied: None,
            error: None,
        };

        report.error = match self.agents.get(&agent_name) {
            None => Some(OrchestrationError::ExecutionError {
                task_id: task.id,
                message: format!("no agent registered as {agent_name:?}"),
            }),
            Some(agent) => {
                let request = AgentRequest {
                    task_id: task.id,
                    title: task.title.clone(),
                    description: task.description.clone(),
                    priority: task.priority,
                    attempt: task.attempts,
                    runner_id: runner.id.clone(),
                    workspace_root: self.workspace_root.clone(),
                };
                info!(task_id = %task.id, agent = %agent_name, runner_id = %runner.id, "executing task");

                let agent_cancel = cancel.child_token();
                let result = match tokio::time::timeout(
                    self.task_timeout,
                    agent.execute(&request, agent_cancel.clone()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        agent_cancel.cancel();
                        Err(AgentError::TimedOut(self.task_timeout))
                    }
                };

                match result {
                    Ok(output) if output.success => {
                        report.output = output.output;
                        match output.mutation {
                            None => None,
                            Some(mutation) => {
                                match self.guard.validate(&mutation.path, &mutation.content) {
                                    Err(source) => {
                                        warn!(
                                            task_id = %task.id,
                                            path = %mutation.path.display(),
                                            error = %source,
                                            "mutation rejected"
                                        );
                                        Some(OrchestrationError::ValidationFailure {
                                            task_id: task.id,
                                            source,
                                        })
                                    }
                                    Ok(target) => match apply_mutation(
                                        &target,
                                        &mutation.content,
                                        &self.backup_dir,
                                        task.id,
                                    )
                                    .await
                                    {
                                        Ok(applied) => {
                                            info!(
                                                task_id = %task.id,
                                                target = %applied.target.display(),
                                                "mutation applied"
                                            );
                                            report.applied = Some(applied);
                                            None
                                        }
                                        Err(e) => Some(OrchestrationError::ExecutionError {
                                            task_id: task.id,
                                            message: format!("{e:#}"),
                                        }),
                                    },
                                }
                            }
                        }
                    }
                    Ok(output) => {
                        report.output = output.output;
                        Some(OrchestrationError::ExecutionError {
                            task_id: task.id,
                            message: output
                                .error
                                .unwrap_or_else(|| "agent reported failure".to_string()),
                        })
                    }
                    Err(AgentError::Cancelled) => {
                        Some(OrchestrationError::Cancelled { task_id: task.id })
                    }
                    Err(AgentError::RunnerFault(message)) => Some(OrchestrationError::RunnerFault {
                        task_id: task.id,
                        runner_id: runner.id.clone(),
                        message,
                    }),
                    Err(e @ (AgentError::Failed(_) | AgentError::TimedOut(_))) => {
                        Some(OrchestrationError::ExecutionError {
                            task_id: task.id,
                            message: e.to_string(),
                        })
                    }
                }
            }
        };

        report.duration = start.elapsed();
        self.log(task, &report).await?;
        Ok(report)
    }

    /// Record an attempt that never reached an agent (e.g. the worker
    /// panicked).
    pub async fn log(&self, task: &Task, report: &ExecutionReport) -> Result<()> {
        let detail = match (&report.error, &report.applied) {
            (Some(e), _) => Some(e.to_string()),
            (None, Some(applied)) => Some(match &applied.original_sha256 {
                Some(sha) => format!("wrote {} (previous sha256 {sha})", applied.target.display()),
                None => format!("created {}", applied.target.display()),
            }),
            (None, None) => None,
        };

        execution_log::append(
            &self.pool,
            &NewExecutionRecord {
                task_id: task.id,
                agent: &report.agent,
                runner_id: Some(&report.runner_id),
                attempt: task.attempts,
                outcome: report.outcome(),
                duration_ms: i64::try_from(report.duration.as_millis()).unwrap_or(i64::MAX),
                detail: detail.as_deref(),
            },
        )
        .await?;
        Ok(())
    }
}
