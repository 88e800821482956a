//! The orchestration cycle: health, discovery, classification, scheduling
//! and execution, repeated on a polling loop.
//!
//! One cycle runs these steps in order:
//!
//! 1. health checks with bounded self-healing, then one recovery attempt
//!    per faulted runner;
//! 2. stale-task sweep and adaptation-policy expiry;
//! 3. retry of failed tasks that still have attempts left;
//! 4. discovery, persisting tasks whose dedup key is new;
//! 5. classification of pending tasks without an agent;
//! 6. assignment and concurrent execution until the queue drains or no
//!    runner can take the next task.
//!
//! Per-task errors are recorded against the task and never abort the
//! cycle. Only storage failures propagate.

mod workers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use drover_db::models::{FailureKind, ProfileKind, Runner, Task};
use drover_db::queries::adaptations;
use drover_db::queries::tasks as task_db;

use crate::classifier::{Classifier, StageContext, TaskText};
use crate::discovery::{DiscoveryAggregator, DiscoveryBatch};
use crate::engine::{EngineConfig, ExecutionEngine, ExecutionReport};
use crate::error::OrchestrationError;
use crate::health::{
    AdaptationDecision, AdaptationEngine, HealthMonitor, HealthReport, INFERENCE_COMPONENT,
};
use crate::scheduler::{Assignment, RunnerCheck, RunnerRecovery, Scheduler};
use crate::state::TaskStateMachine;

use workers::{Finished, Workers};

/// `[orchestrator]` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub poll_interval_secs: u64,
    pub max_in_progress: usize,
    pub max_runners: usize,
    pub max_attempts: i32,
    pub stale_after_secs: u64,
    pub per_source_limit: usize,
    pub source_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub workspace_root: PathBuf,
    pub backup_dir: PathBuf,
    pub deny_patterns: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            poll_interval_secs: 30,
            max_in_progress: crate::scheduler::DEFAULT_MAX_IN_PROGRESS,
            max_runners: crate::scheduler::DEFAULT_MAX_RUNNERS,
            max_attempts: 3,
            stale_after_secs: 4 * 60 * 60,
            per_source_limit: crate::discovery::DEFAULT_PER_SOURCE_LIMIT,
            source_timeout_secs: crate::discovery::DEFAULT_SOURCE_TIMEOUT.as_secs(),
            task_timeout_secs: engine.task_timeout_secs,
            workspace_root: engine.workspace_root,
            backup_dir: engine.backup_dir,
            deny_patterns: engine.deny_patterns,
        }
    }
}

impl OrchestratorConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            workspace_root: self.workspace_root.clone(),
            backup_dir: self.backup_dir.clone(),
            deny_patterns: self.deny_patterns.clone(),
            task_timeout_secs: self.task_timeout_secs,
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Result of persisting one discovery pass.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub batch: DiscoveryBatch,
    /// Tasks whose dedup key was new to the store.
    pub inserted: Vec<Task>,
}

/// Discover from every source and store the tasks not seen before.
pub async fn ingest(
    pool: &SqlitePool,
    discovery: &DiscoveryAggregator,
    max_attempts: i32,
) -> Result<IngestReport> {
    let batch = discovery.discover().await;
    let mut inserted = Vec::new();

    for candidate in &batch.tasks {
        let new = task_db::NewTask {
            title: &candidate.title,
            description: &candidate.description,
            source_id: &candidate.source_id,
            source_kind: candidate.source_kind,
            priority: candidate.priority,
            dedup_key: &candidate.dedup_key,
            max_attempts,
        };
        match task_db::insert_task_if_new(pool, &new).await? {
            Some(task) => {
                info!(
                    task_id = %task.id,
                    title = %task.title,
                    priority = %task.priority,
                    source = %task.source_id,
                    "task discovered"
                );
                inserted.push(task);
            }
            None => debug!(dedup_key = %candidate.dedup_key, "task already known"),
        }
    }

    Ok(IngestReport { batch, inserted })
}

/// Classify every pending task that has no agent yet. Returns how many
/// were classified.
pub async fn classify_pending(
    pool: &SqlitePool,
    classifier: &Classifier,
    ctx: &StageContext,
) -> Result<usize> {
    let mut classified = 0;
    for task in task_db::list_pending_tasks(pool).await? {
        if task.assigned_agent.is_some() {
            continue;
        }
        let report = classifier
            .classify(
                TaskText {
                    title: &task.title,
                    description: &task.description,
                },
                ctx,
            )
            .await;
        let c = &report.classification;
        let rows = task_db::set_classification(
            pool,
            task.id,
            &c.agent,
            c.method.as_str(),
            c.confidence,
        )
        .await?;
        if rows > 0 {
            info!(
                task_id = %task.id,
                agent = %c.agent,
                method = c.method.as_str(),
                confidence = c.confidence,
                stages = report.trace.len(),
                "task classified"
            );
            classified += 1;
        }
    }
    Ok(classified)
}

/// Move failed tasks with attempts left back to pending.
pub async fn retry_failed(pool: &SqlitePool) -> Result<Vec<Uuid>> {
    let mut retried = Vec::new();
    for task in task_db::list_retryable_tasks(pool).await? {
        if TaskStateMachine::retry(pool, &task).await? {
            retried.push(task.id);
        }
    }
    Ok(retried)
}

/// How one dispatched task ended this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Completed,
    Failed(FailureKind),
    Requeued(FailureKind),
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub title: String,
    pub agent: String,
    pub runner_id: String,
    pub result: TaskResult,
    pub error: Option<String>,
}

/// Everything one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub health: HealthReport,
    pub runner_recoveries: Vec<RunnerRecovery>,
    pub stale_reset: Vec<Uuid>,
    pub expired_policies: Vec<String>,
    pub retried: Vec<Uuid>,
    pub discovered: usize,
    pub inserted: usize,
    pub failed_sources: Vec<String>,
    pub classified: usize,
    pub dispatched: usize,
    /// Tasks left pending because no runner could take them.
    pub queued: usize,
    pub outcomes: Vec<TaskOutcome>,
    pub adaptations: Vec<AdaptationDecision>,
}

impl CycleReport {
    /// Nothing was dispatched.
    pub fn is_idle(&self) -> bool {
        self.dispatched == 0
    }

    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.result == TaskResult::Completed)
            .count()
    }
}

/// Bounds for [`Orchestrator::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimits {
    /// Stop after this many tasks reached an outcome.
    pub max_tasks: Option<usize>,
    /// Stop after a cycle that dispatched nothing.
    pub stop_on_empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxTasks,
    Empty,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub requeued: usize,
    pub stopped: StopReason,
}

/// Collaborators the orchestrator is built from.
pub struct Components {
    pub discovery: DiscoveryAggregator,
    pub classifier: Classifier,
    pub engine: ExecutionEngine,
    pub scheduler: Scheduler,
    pub health: HealthMonitor,
    pub adaptation: AdaptationEngine,
    pub runner_check: Box<dyn RunnerCheck>,
}

pub struct Orchestrator {
    pool: SqlitePool,
    config: OrchestratorConfig,
    discovery: DiscoveryAggregator,
    classifier: Classifier,
    engine: Arc<ExecutionEngine>,
    scheduler: Scheduler,
    health: HealthMonitor,
    adaptation: AdaptationEngine,
    runner_check: Box<dyn RunnerCheck>,
    cycle: u64,
}

/// Report for an attempt that ended without the engine producing one.
fn fault_report(task: &Task, runner: &Runner, message: String) -> ExecutionReport {
    ExecutionReport {
        task_id: task.id,
        agent: task.assigned_agent.clone().unwrap_or_default(),
        runner_id: runner.id.clone(),
        duration: Duration::ZERO,
        output: String::new(),
        applied: None,
        error: Some(OrchestrationError::RunnerFault {
            task_id: task.id,
            runner_id: runner.id.clone(),
            message,
        }),
    }
}

impl Orchestrator {
    /// Build the orchestrator and reset tasks that went stale while no
    /// process was running.
    pub async fn load(
        pool: SqlitePool,
        config: OrchestratorConfig,
        components: Components,
    ) -> Result<Self> {
        let reset = TaskStateMachine::sweep_stale(&pool, config.stale_after()).await?;
        if !reset.is_empty() {
            info!(count = reset.len(), "reset stale tasks on load");
        }

        Ok(Self {
            pool,
            config,
            discovery: components.discovery,
            classifier: components.classifier,
            engine: Arc::new(components.engine),
            scheduler: components.scheduler,
            health: components.health,
            adaptation: components.adaptation,
            runner_check: components.runner_check,
            cycle: 0,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn adaptation(&self) -> &AdaptationEngine {
        &self.adaptation
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    fn required_profile(&self, task: &Task) -> ProfileKind {
        task.assigned_agent
            .as_deref()
            .and_then(|agent| self.engine.agents().profile_for(agent))
            .unwrap_or(ProfileKind::Light)
    }

    /// Run one full cycle, dispatching at most `budget` tasks.
    pub async fn run_cycle(
        &mut self,
        cancel: &CancellationToken,
        budget: Option<usize>,
    ) -> Result<CycleReport> {
        self.cycle += 1;
        let cycle = self.cycle;
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };
        info!(cycle, "cycle started");

        report.health = self.health.run_cycle(cycle).await?;
        report.runner_recoveries = self
            .scheduler
            .recover_faulted(self.runner_check.as_ref())
            .await?;

        report.stale_reset =
            TaskStateMachine::sweep_stale(&self.pool, self.config.stale_after()).await?;
        report.expired_policies = self.adaptation.expire(cycle);
        for policy in &report.expired_policies {
            info!(cycle, policy = %policy, "adaptation policy expired");
        }

        report.retried = retry_failed(&self.pool).await?;

        let ingest = ingest(&self.pool, &self.discovery, self.config.max_attempts).await?;
        report.discovered = ingest.batch.tasks.len();
        report.inserted = ingest.inserted.len();
        report.failed_sources = ingest
            .batch
            .failed_sources()
            .map(|r| r.source.clone())
            .collect();

        let ctx = StageContext {
            catalog: self.engine.agents().names(),
            inference_healthy: report
                .health
                .is_healthy(INFERENCE_COMPONENT)
                .unwrap_or(true),
        };
        report.classified = classify_pending(&self.pool, &self.classifier, &ctx).await?;

        if !cancel.is_cancelled() {
            self.dispatch(cancel, budget, &mut report).await?;
        }

        info!(
            cycle,
            discovered = report.discovered,
            inserted = report.inserted,
            dispatched = report.dispatched,
            completed = report.completed(),
            queued = report.queued,
            "cycle finished"
        );
        Ok(report)
    }

    async fn dispatch(
        &mut self,
        cancel: &CancellationToken,
        budget: Option<usize>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let pending: Vec<Task> = task_db::list_pending_tasks(&self.pool)
            .await?
            .into_iter()
            .filter(|t| t.assigned_agent.is_some())
            .collect();
        let mut queue = self
            .adaptation
            .order_tasks(pending, |t| self.required_profile(t));

        let mut workers: Workers<(Task, Runner), Result<ExecutionReport>> = Workers::new();

        loop {
            let mut index = 0;
            while index < queue.len() {
                if cancel.is_cancelled() || budget.is_some_and(|b| report.dispatched >= b) {
                    break;
                }
                let required = self.required_profile(&queue[index]);
                match self.scheduler.assign(&queue[index], required).await? {
                    Assignment::Assigned(runner) => {
                        let task = queue.remove(index);
                        report.dispatched += 1;
                        let engine = Arc::clone(&self.engine);
                        let token = cancel.child_token();
                        let (worker_task, worker_runner) = (task.clone(), runner.clone());
                        workers.spawn((task, runner), async move {
                            engine.execute(&worker_task, &worker_runner, token).await
                        });
                    }
                    Assignment::Queued(reason) => {
                        debug!(task_id = %queue[index].id, reason = %reason, "task stays queued");
                        index += 1;
                    }
                    Assignment::Superseded => {
                        queue.remove(index);
                    }
                }
            }

            let Some(((task, runner), finished)) = workers.join_next().await else {
                break;
            };

            let execution = match finished {
                Finished::Done(execution) => execution?,
                Finished::Panicked(message) => {
                    let execution =
                        fault_report(&task, &runner, format!("agent panicked: {message}"));
                    self.engine.log(&task, &execution).await?;
                    execution
                }
                Finished::Aborted => {
                    let execution =
                        fault_report(&task, &runner, "execution worker was aborted".to_string());
                    self.engine.log(&task, &execution).await?;
                    execution
                }
            };

            let outcome = self.settle(&task, &runner, execution).await?;
            report.outcomes.push(outcome);

            if let Some(decision) = self.adaptation.evaluate(self.cycle) {
                adaptations::append(
                    &self.pool,
                    &decision.kind,
                    &decision.reason,
                    &decision.action,
                    Utc::now(),
                )
                .await?;
                report.adaptations.push(decision);
            }
        }

        report.queued = queue.len();
        for task in &queue {
            let reason = OrchestrationError::AssignmentTimeout {
                task_id: task.id,
                required: self.required_profile(task).to_string(),
            };
            info!(task_id = %task.id, reason = %reason, "task left queued this cycle");
        }
        Ok(())
    }

    /// Apply the task transition and runner update for a finished
    /// execution.
    async fn settle(
        &mut self,
        task: &Task,
        runner: &Runner,
        execution: ExecutionReport,
    ) -> Result<TaskOutcome> {
        let result = match &execution.error {
            None => {
                TaskStateMachine::complete(&self.pool, task.id).await?;
                self.scheduler.release(&runner.id, task.id, true).await?;
                info!(task_id = %task.id, agent = %execution.agent, runner_id = %runner.id, "task completed");
                TaskResult::Completed
            }
            Some(error @ OrchestrationError::RunnerFault { .. })
                if task.attempts < task.max_attempts =>
            {
                warn!(task_id = %task.id, runner_id = %runner.id, error = %error, "runner fault, requeueing task");
                TaskStateMachine::requeue(
                    &self.pool,
                    task.id,
                    FailureKind::RunnerFault,
                    &error.to_string(),
                )
                .await?;
                self.scheduler.fault(&runner.id, task.id).await?;
                TaskResult::Requeued(FailureKind::RunnerFault)
            }
            Some(error @ OrchestrationError::RunnerFault { .. }) => {
                warn!(
                    task_id = %task.id,
                    runner_id = %runner.id,
                    attempts = task.attempts,
                    error = %error,
                    "runner fault with no attempts left, failing task"
                );
                TaskStateMachine::fail(
                    &self.pool,
                    task.id,
                    FailureKind::RunnerFault,
                    &error.to_string(),
                )
                .await?;
                self.scheduler.fault(&runner.id, task.id).await?;
                TaskResult::Failed(FailureKind::RunnerFault)
            }
            Some(error) => {
                let kind = error.failure_kind().unwrap_or(FailureKind::ExecutionError);
                warn!(task_id = %task.id, agent = %execution.agent, kind = %kind, error = %error, "task failed");
                TaskStateMachine::fail(&self.pool, task.id, kind, &error.to_string()).await?;
                self.scheduler.release(&runner.id, task.id, false).await?;
                TaskResult::Failed(kind)
            }
        };

        self.adaptation
            .record(&execution.agent, result == TaskResult::Completed);

        Ok(TaskOutcome {
            task_id: task.id,
            title: task.title.clone(),
            agent: execution.agent,
            runner_id: runner.id.clone(),
            result,
            error: execution.error.map(|e| e.to_string()),
        })
    }

    /// Run cycles until a limit is reached or `cancel` fires.
    pub async fn run(&mut self, limits: RunLimits, cancel: CancellationToken) -> Result<RunSummary> {
        let mut summary = RunSummary {
            cycles: 0,
            processed: 0,
            completed: 0,
            failed: 0,
            requeued: 0,
            stopped: StopReason::Cancelled,
        };

        loop {
            if cancel.is_cancelled() {
                summary.stopped = StopReason::Cancelled;
                break;
            }

            let budget = limits
                .max_tasks
                .map(|max| max.saturating_sub(summary.processed));
            let report = self.run_cycle(&cancel, budget).await?;
            summary.cycles += 1;
            for outcome in &report.outcomes {
                summary.processed += 1;
                match outcome.result {
                    TaskResult::Completed => summary.completed += 1,
                    TaskResult::Failed(_) => summary.failed += 1,
                    TaskResult::Requeued(_) => summary.requeued += 1,
                }
            }

            if limits.max_tasks.is_some_and(|max| summary.processed >= max) {
                summary.stopped = StopReason::MaxTasks;
                break;
            }
            if limits.stop_on_empty && report.is_idle() {
                summary.stopped = StopReason::Empty;
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = cancel.cancelled() => {
                    summary.stopped = StopReason::Cancelled;
                    break;
                }
            }
        }

        info!(
            cycles = summary.cycles,
            processed = summary.processed,
            completed = summary.completed,
            failed = summary.failed,
            requeued = summary.requeued,
            stopped = ?summary.stopped,
            "run finished"
        );
        Ok(summary)
    }
}
