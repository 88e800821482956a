//! Resource scheduler: plans runner instances against the machine's
//! resources at startup and assigns pending tasks to idle runners.
//!
//! The live registry sits behind a `tokio::sync::Mutex` and every change is
//! mirrored to the `runners` table while the lock is held, so the stored
//! registry never runs ahead of or behind the in-memory one.

pub mod profile;
pub mod resources;

use std::cmp::Reverse;
use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use drover_db::models::{ProfileKind, Runner, RunnerStatus, Task};
use drover_db::queries::{runners as runner_db, tasks as task_db};

use crate::error::OrchestrationError;

pub use profile::{CATALOG, Capacity, LimitingFactor, RunnerProfile, capacity, profile};
pub use resources::{GpuInfo, ResourceOverrides, SystemResources};

pub const DEFAULT_MAX_RUNNERS: usize = 50;
pub const DEFAULT_MAX_IN_PROGRESS: usize = 5;

/// `[pool]`: how many runners of each profile to try to place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub light: u32,
    pub standard: u32,
    pub gpu_light: u32,
    pub gpu_heavy: u32,
    pub gpu_max: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            light: 4,
            standard: 2,
            gpu_light: 2,
            gpu_heavy: 1,
            gpu_max: 0,
        }
    }
}

impl PoolConfig {
    pub fn desired(&self, kind: ProfileKind) -> u32 {
        match kind {
            ProfileKind::Light => self.light,
            ProfileKind::Standard => self.standard,
            ProfileKind::GpuLight => self.gpu_light,
            ProfileKind::GpuHeavy => self.gpu_heavy,
            ProfileKind::GpuMax => self.gpu_max,
        }
    }
}

/// Place runners one at a time against the remaining resources.
///
/// GPU profiles bind to the GPU with the most remaining free memory (lowest
/// id on ties). A profile stops being placed as soon as one instance does
/// not fit. At most `max_runners` instances are created.
pub fn plan_runners(
    resources: &SystemResources,
    pool: &PoolConfig,
    max_runners: usize,
) -> Vec<Runner> {
    let mut cpu_left = resources.cpu_cores;
    let mut ram_left = resources.free_ram_mb;
    let mut gpu_left: Vec<(i64, u64)> = resources.gpus.iter().map(|g| (g.id, g.free_mb)).collect();
    let mut planned = Vec::new();
    let now = Utc::now();

    'profiles: for p in &CATALOG {
        for n in 0..pool.desired(p.kind) {
            if planned.len() >= max_runners {
                info!(max_runners, "runner limit reached during planning");
                break 'profiles;
            }
            if cpu_left < p.cpu_cores || ram_left < p.ram_mb {
                warn!(profile = %p.kind, placed = n, "insufficient cpu or ram for more runners");
                break;
            }

            let gpu_id = if p.needs_gpu() {
                let best = gpu_left
                    .iter_mut()
                    .filter(|(_, free)| *free >= p.gpu_memory_mb)
                    .max_by_key(|(id, free)| (*free, Reverse(*id)));
                match best {
                    Some((id, free)) => {
                        *free -= p.gpu_memory_mb;
                        Some(*id)
                    }
                    None => {
                        warn!(profile = %p.kind, placed = n, "insufficient gpu memory for more runners");
                        break;
                    }
                }
            } else {
                None
            };

            cpu_left -= p.cpu_cores;
            ram_left -= p.ram_mb;
            planned.push(Runner {
                id: format!("{}-{n}", p.kind),
                profile: p.kind,
                gpu_id,
                status: RunnerStatus::Idle,
                current_task: None,
                tasks_completed: 0,
                recovery_attempts: 0,
                updated_at: now,
            });
        }
    }

    planned
}

/// Result of trying to place one task.
#[derive(Debug)]
pub enum Assignment {
    /// The task is now `in_progress` on this runner.
    Assigned(Runner),
    /// No capacity right now; the task stays pending.
    Queued(OrchestrationError),
    /// The task was no longer pending when the CAS ran.
    Superseded,
}

/// Decides whether a faulted runner can be put back into service.
#[async_trait]
pub trait RunnerCheck: Send + Sync {
    async fn ready(&self, runner: &Runner) -> bool;
}

/// GPU runners are ready when their GPU is still present; CPU runners
/// always are.
pub struct GpuPresenceCheck;

#[async_trait]
impl RunnerCheck for GpuPresenceCheck {
    async fn ready(&self, runner: &Runner) -> bool {
        match runner.gpu_id {
            None => true,
            Some(id) => SystemResources::probe().await.gpus.iter().any(|g| g.id == id),
        }
    }
}

/// Outcome of one faulted runner's single recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerRecovery {
    pub runner_id: String,
    pub recovered: bool,
}

pub struct Scheduler {
    pool: SqlitePool,
    runners: Mutex<Vec<Runner>>,
    gpu_totals: HashMap<i64, u64>,
    max_in_progress: usize,
}

impl Scheduler {
    /// Plan the registry and replace the stored one with it.
    pub async fn start(
        pool: SqlitePool,
        resources: &SystemResources,
        pool_config: &PoolConfig,
        max_runners: usize,
        max_in_progress: usize,
    ) -> Result<Self> {
        for p in &CATALOG {
            let cap = capacity(p, resources);
            debug!(
                profile = %p.kind,
                max_instances = cap.max_instances,
                limiting_factor = ?cap.limiting_factor,
                desired = pool_config.desired(p.kind),
                "profile capacity"
            );
        }
        let planned = plan_runners(resources, pool_config, max_runners);
        runner_db::replace_runners(&pool, &planned)
            .await
            .context("failed to persist runner registry")?;

        info!(
            runners = planned.len(),
            cpu_cores = resources.cpu_cores,
            free_ram_mb = resources.free_ram_mb,
            gpus = resources.gpus.len(),
            "runner registry planned"
        );

        Ok(Self {
            pool,
            runners: Mutex::new(planned),
            gpu_totals: resources.gpus.iter().map(|g| (g.id, g.total_mb)).collect(),
            max_in_progress,
        })
    }

    /// Snapshot of the registry.
    pub async fn runners(&self) -> Vec<Runner> {
        self.runners.lock().await.clone()
    }

    pub async fn running_count(&self) -> usize {
        self.runners
            .lock()
            .await
            .iter()
            .filter(|r| r.status == RunnerStatus::Running)
            .count()
    }

    pub async fn has_idle_runner(&self) -> bool {
        self.runners
            .lock()
            .await
            .iter()
            .any(|r| r.status == RunnerStatus::Idle)
    }

    /// GPU memory not reserved by running runners.
    fn gpu_free(&self, runners: &[Runner], gpu_id: i64) -> u64 {
        let total = self.gpu_totals.get(&gpu_id).copied().unwrap_or(0);
        let used: u64 = runners
            .iter()
            .filter(|r| r.status == RunnerStatus::Running && r.gpu_id == Some(gpu_id))
            .map(|r| profile(r.profile).gpu_memory_mb)
            .sum();
        total.saturating_sub(used)
    }

    /// Index of the runner `required` should go to, if any.
    fn pick(&self, runners: &[Runner], required: ProfileKind) -> Option<usize> {
        runners
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == RunnerStatus::Idle && r.profile >= required)
            .min_by_key(|(_, r)| {
                let gpu_free = r.gpu_id.map(|g| self.gpu_free(runners, g)).unwrap_or(u64::MAX);
                (r.profile != required, Reverse(gpu_free), r.profile, r.id.clone())
            })
            .map(|(i, _)| i)
    }

    /// Try to start `task` on an idle runner able to host `required`.
    pub async fn assign(&self, task: &Task, required: ProfileKind) -> Result<Assignment> {
        let mut runners = self.runners.lock().await;

        let running = runners
            .iter()
            .filter(|r| r.status == RunnerStatus::Running)
            .count();
        if running >= self.max_in_progress {
            return Ok(Assignment::Queued(OrchestrationError::AssignmentTimeout {
                task_id: task.id,
                required: format!("{required} (max_in_progress {} reached)", self.max_in_progress),
            }));
        }

        let Some(index) = self.pick(&runners, required) else {
            return Ok(Assignment::Queued(OrchestrationError::AssignmentTimeout {
                task_id: task.id,
                required: required.to_string(),
            }));
        };

        let runner_id = runners[index].id.clone();
        let rows = task_db::start_task(&self.pool, task.id, &runner_id, Utc::now()).await?;
        if rows == 0 {
            return Ok(Assignment::Superseded);
        }

        let runner = &mut runners[index];
        runner.status = RunnerStatus::Running;
        runner.current_task = Some(task.id);
        runner.updated_at = Utc::now();
        runner_db::update_runner(&self.pool, runner).await?;

        info!(task_id = %task.id, runner_id = %runner.id, profile = %runner.profile, "task assigned");
        Ok(Assignment::Assigned(runner.clone()))
    }

    async fn update<F>(&self, runner_id: &str, task_id: Uuid, f: F) -> Result<()>
    where
        F: FnOnce(&mut Runner),
    {
        let mut runners = self.runners.lock().await;
        let Some(runner) = runners.iter_mut().find(|r| r.id == runner_id) else {
            anyhow::bail!("runner {runner_id} not in registry");
        };
        if runner.current_task != Some(task_id) {
            warn!(
                runner_id,
                task_id = %task_id,
                current = ?runner.current_task,
                "releasing runner that holds a different task"
            );
        }
        f(runner);
        runner.updated_at = Utc::now();
        runner_db::update_runner(&self.pool, runner).await
    }

    /// Return a runner to idle after its task finished.
    pub async fn release(&self, runner_id: &str, task_id: Uuid, succeeded: bool) -> Result<()> {
        self.update(runner_id, task_id, |r| {
            r.status = RunnerStatus::Idle;
            r.current_task = None;
            if succeeded {
                r.tasks_completed += 1;
            }
        })
        .await
    }

    /// Take a runner out of service after a fault.
    pub async fn fault(&self, runner_id: &str, task_id: Uuid) -> Result<()> {
        warn!(runner_id, task_id = %task_id, "runner faulted");
        self.update(runner_id, task_id, |r| {
            r.status = RunnerStatus::Error;
            r.current_task = None;
            r.recovery_attempts = 0;
        })
        .await
    }

    /// Give every faulted runner that has not yet had one its single
    /// recovery attempt.
    pub async fn recover_faulted(&self, check: &dyn RunnerCheck) -> Result<Vec<RunnerRecovery>> {
        let mut runners = self.runners.lock().await;
        let mut results = Vec::new();

        for runner in runners
            .iter_mut()
            .filter(|r| r.status == RunnerStatus::Error && r.recovery_attempts == 0)
        {
            runner.recovery_attempts += 1;
            let recovered = check.ready(runner).await;
            if recovered {
                runner.status = RunnerStatus::Idle;
                info!(runner_id = %runner.id, "runner recovered");
            } else {
                warn!(runner_id = %runner.id, "runner recovery failed; leaving it in error");
            }
            runner.updated_at = Utc::now();
            runner_db::update_runner(&self.pool, runner).await?;
            results.push(RunnerRecovery {
                runner_id: runner.id.clone(),
                recovered,
            });
        }

        Ok(results)
    }
}
