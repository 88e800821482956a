//! Health monitoring and self-healing.
//!
//! Each cycle every registered component is checked under a timeout and
//! the result is appended to the rolling health history. An unhealthy
//! required component gets at most one recovery action and one re-check
//! per cycle; whatever state remains is reported to the caller.

pub mod adaptation;
pub mod checks;
pub mod recovery;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use drover_db::queries::health as db;

pub use adaptation::{AdaptationConfig, AdaptationDecision, AdaptationEngine};
pub use checks::{
    CommandHealthCheck, HttpHealthCheck, INFERENCE_COMPONENT, InferenceHealthCheck,
    ServiceConfig, StoreHealthCheck,
};
pub use recovery::{CommandRecovery, RecoveryAction, RecoveryState, RecoveryTracker};

/// A probe against one dependency.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Whether an unhealthy result should trigger recovery.
    fn required(&self) -> bool {
        true
    }

    async fn check(&self) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn HealthCheck) {}
};

/// `[health]` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_timeout_secs: u64,
    pub recovery_timeout_secs: u64,
    pub history_limit: i64,
    pub max_recovery_attempts: u32,
    pub services: Vec<ServiceConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: 5,
            recovery_timeout_secs: 60,
            history_limit: 200,
            max_recovery_attempts: recovery::DEFAULT_MAX_RECOVERY_ATTEMPTS,
            services: Vec::new(),
        }
    }
}

/// What happened to an unhealthy component this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Healthy on the first check.
    NotNeeded,
    /// Optional component, or no recovery action configured.
    NotAttempted,
    Recovered,
    StillUnhealthy,
    BackingOff { next_cycle: u64 },
    GaveUp,
}

#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub name: String,
    pub required: bool,
    pub healthy: bool,
    pub detail: Option<String>,
    pub recovery: RecoveryOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub cycle: u64,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    /// `None` when no component of that name is monitored.
    pub fn is_healthy(&self, name: &str) -> Option<bool> {
        self.components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.healthy)
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &ComponentHealth> {
        self.components.iter().filter(|c| !c.healthy)
    }

    pub fn all_healthy(&self) -> bool {
        self.components.iter().all(|c| c.healthy)
    }

    pub fn recovery_attempts(&self) -> usize {
        self.components
            .iter()
            .filter(|c| {
                matches!(
                    c.recovery,
                    RecoveryOutcome::Recovered | RecoveryOutcome::StillUnhealthy
                )
            })
            .count()
    }
}

struct Component {
    check: Arc<dyn HealthCheck>,
    recovery: Option<Arc<dyn RecoveryAction>>,
    tracker: RecoveryTracker,
}

pub struct HealthMonitor {
    pool: SqlitePool,
    components: Vec<Component>,
    check_timeout: Duration,
    recovery_timeout: Duration,
    history_limit: i64,
    max_recovery_attempts: u32,
}

impl HealthMonitor {
    pub fn new(pool: SqlitePool, config: &HealthConfig) -> Self {
        Self {
            pool,
            components: Vec::new(),
            check_timeout: Duration::from_secs(config.check_timeout_secs.max(1)),
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs.max(1)),
            history_limit: config.history_limit.max(1),
            max_recovery_attempts: config.max_recovery_attempts,
        }
    }

    /// Override the per-check timeout (tests use sub-second values).
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn add(
        &mut self,
        check: Arc<dyn HealthCheck>,
        recovery: Option<Arc<dyn RecoveryAction>>,
    ) -> &mut Self {
        self.components.push(Component {
            check,
            recovery,
            tracker: RecoveryTracker::new(self.max_recovery_attempts),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Check every component once, recovering where allowed.
    ///
    /// Only a failure to write the health history is returned as `Err`.
    pub async fn run_cycle(&mut self, cycle: u64) -> Result<HealthReport> {
        let mut report = HealthReport {
            cycle,
            components: Vec::with_capacity(self.components.len()),
        };

        for component in &mut self.components {
            let name = component.check.name().to_string();
            let required = component.check.required();

            let first = probe(component.check.as_ref(), self.check_timeout).await;
            record(&self.pool, &name, &first, self.history_limit).await?;

            let (healthy, detail, recovery) = match first {
                Ok(()) => {
                    component.tracker.record_success();
                    debug!(component = %name, "healthy");
                    (true, None, RecoveryOutcome::NotNeeded)
                }
                Err(reason) => {
                    heal(
                        component,
                        &self.pool,
                        cycle,
                        reason,
                        self.check_timeout,
                        self.recovery_timeout,
                        self.history_limit,
                    )
                    .await?
                }
            };

            report.components.push(ComponentHealth {
                name,
                required,
                healthy,
                detail,
                recovery,
            });
        }

        Ok(report)
    }
}

/// One bounded recovery attempt plus one re-check, if the tracker allows.
async fn heal(
    component: &mut Component,
    pool: &SqlitePool,
    cycle: u64,
    reason: String,
    check_timeout: Duration,
    recovery_timeout: Duration,
    keep: i64,
) -> Result<(bool, Option<String>, RecoveryOutcome)> {
    let name = component.check.name().to_string();
    let required = component.check.required();

    let action = match (&component.recovery, required) {
        (Some(action), true) => Arc::clone(action),
        _ => {
            warn!(component = %name, required, error = %reason, "unhealthy");
            return Ok((false, Some(reason), RecoveryOutcome::NotAttempted));
        }
    };

    match component.tracker.state(cycle) {
        RecoveryState::Ready => {}
        RecoveryState::BackingOff { next_cycle } => {
            warn!(
                component = %name,
                next_cycle,
                error = %reason,
                "unhealthy, recovery backing off"
            );
            return Ok((false, Some(reason), RecoveryOutcome::BackingOff { next_cycle }));
        }
        RecoveryState::GaveUp => {
            warn!(
                component = %name,
                error = %reason,
                "unhealthy, recovery attempts exhausted"
            );
            return Ok((false, Some(reason), RecoveryOutcome::GaveUp));
        }
    }

    info!(component = %name, action = %action.describe(), error = %reason, "attempting recovery");
    if let Err(e) = run_recovery(action.as_ref(), recovery_timeout).await {
        warn!(component = %name, error = %e, "recovery action failed");
    }

    let second = probe(component.check.as_ref(), check_timeout).await;
    record(pool, &name, &second, keep).await?;
    match second {
        Ok(()) => {
            component.tracker.record_success();
            info!(component = %name, "recovered");
            Ok((true, None, RecoveryOutcome::Recovered))
        }
        Err(reason) => {
            component.tracker.record_failure(cycle);
            warn!(
                component = %name,
                failures = component.tracker.consecutive_failures(),
                error = %reason,
                "still unhealthy after recovery"
            );
            Ok((false, Some(reason), RecoveryOutcome::StillUnhealthy))
        }
    }
}

async fn probe(check: &dyn HealthCheck, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, check.check()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_) => Err(format!("check timed out after {timeout:?}")),
    }
}

async fn run_recovery(action: &dyn RecoveryAction, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, action.recover()).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("recovery timed out after {timeout:?}"),
    }
}

async fn record(
    pool: &SqlitePool,
    component: &str,
    result: &Result<(), String>,
    keep: i64,
) -> Result<()> {
    db::record(
        pool,
        component,
        result.is_ok(),
        result.as_ref().err().map(String::as_str),
        Utc::now(),
        keep,
    )
    .await
}
