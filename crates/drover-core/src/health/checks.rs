//! Concrete health checks and the `[[health.services]]` config that
//! builds them.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::process::Command;

use drover_db::pool;

use super::HealthCheck;
use super::recovery::{CommandRecovery, RecoveryAction};
use crate::inference::InferenceBackend;

/// GET `url`; any 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    name: String,
    url: String,
    required: bool,
    client: Client,
}

impl HttpHealthCheck {
    pub fn new(name: impl Into<String>, url: impl Into<String>, required: bool) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            required,
            client,
        })
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn check(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?;
        if !response.status().is_success() {
            bail!("GET {} returned {}", self.url, response.status());
        }
        Ok(())
    }
}

/// Run a command; exit code 0 is healthy.
#[derive(Debug, Clone)]
pub struct CommandHealthCheck {
    name: String,
    command: String,
    args: Vec<String>,
    required: bool,
}

impl CommandHealthCheck {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            required,
        }
    }
}

#[async_trait]
impl HealthCheck for CommandHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn check(&self) -> Result<()> {
        let output = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.command))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} exited with {}: {}", self.command, output.status, stderr.trim());
        }
        Ok(())
    }
}

/// The state store answers queries.
#[derive(Debug, Clone)]
pub struct StoreHealthCheck {
    pool: SqlitePool,
}

impl StoreHealthCheck {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthCheck for StoreHealthCheck {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> Result<()> {
        pool::ping(&self.pool).await
    }
}

/// Component name whose health gates the inference classifier stages.
pub const INFERENCE_COMPONENT: &str = "inference";

/// The inference backend is reachable.
pub struct InferenceHealthCheck {
    backend: Arc<dyn InferenceBackend>,
    required: bool,
}

impl InferenceHealthCheck {
    pub fn new(backend: Arc<dyn InferenceBackend>, required: bool) -> Self {
        Self { backend, required }
    }
}

#[async_trait]
impl HealthCheck for InferenceHealthCheck {
    fn name(&self) -> &str {
        INFERENCE_COMPONENT
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn check(&self) -> Result<()> {
        self.backend.ping().await
    }
}

fn default_true() -> bool {
    true
}

fn default_settle_secs() -> u64 {
    5
}

/// One `[[health.services]]` entry: how to probe a dependency and,
/// optionally, how to start it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Probe with an HTTP GET.
    #[serde(default)]
    pub url: Option<String>,
    /// Probe by running a command.
    #[serde(default)]
    pub check_command: Option<String>,
    #[serde(default)]
    pub check_args: Vec<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub start_args: Vec<String>,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

impl ServiceConfig {
    pub fn build(&self) -> Result<(Arc<dyn HealthCheck>, Option<Arc<dyn RecoveryAction>>)> {
        let check: Arc<dyn HealthCheck> = match (&self.url, &self.check_command) {
            (Some(url), None) => Arc::new(HttpHealthCheck::new(&self.name, url, self.required)?),
            (None, Some(command)) => Arc::new(CommandHealthCheck::new(
                &self.name,
                command,
                self.check_args.clone(),
                self.required,
            )),
            (Some(_), Some(_)) => {
                bail!("service {}: set either url or check_command, not both", self.name)
            }
            (None, None) => bail!("service {}: needs a url or a check_command", self.name),
        };

        let recovery = self.start_command.as_ref().map(|command| {
            Arc::new(CommandRecovery::new(
                command,
                self.start_args.clone(),
                Duration::from_secs(self.settle_secs),
            )) as Arc<dyn RecoveryAction>
        });

        Ok((check, recovery))
    }
}
