//! An agent backed by an external command.
//!
//! The task prompt goes to the child's stdin; stdout becomes the output.
//! Exit code 0 is success. When `emits_mutation` is set, stdout must be a
//! JSON object `{"path": ..., "content": ...}` describing one file write.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use drover_db::models::ProfileKind;

use super::{Agent, AgentOutput, AgentRequest, Capability, Mutation};
use crate::error::AgentError;

fn default_profile() -> ProfileKind {
    ProfileKind::Light
}

fn default_timeout_secs() -> u64 {
    1800
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAgentConfig {
    pub name: String,
    pub capability: Capability,
    #[serde(default = "default_profile")]
    pub profile: ProfileKind,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub emits_mutation: bool,
}

/// Runs `command args...` per task.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: CommandAgentConfig,
}

impl CommandAgent {
    pub fn new(config: CommandAgentConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs.max(1))
    }
}

enum Finished {
    Exited(std::io::Result<std::process::ExitStatus>, String, String),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capability(&self) -> Capability {
        self.config.capability
    }

    fn profile(&self) -> ProfileKind {
        self.config.profile
    }

    async fn execute(
        &self,
        request: &AgentRequest,
        cancel: CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        let start = Instant::now();

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .current_dir(&request.workspace_root)
            .env("DROVER_TASK_ID", request.task_id.to_string())
            .env("DROVER_TASK_TITLE", &request.title)
            .env("DROVER_RUNNER_ID", &request.runner_id)
            .env("DROVER_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::RunnerFault(format!(
                    "failed to spawn {} for agent {}: {e}",
                    self.config.command, self.config.name
                ))
            })?;

        let prompt = request.prompt();
        let mut stdin_pipe = child.stdin.take();
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        // The child may exit without reading stdin; a broken pipe is not
        // an error here.
        let write_stdin = async {
            if let Some(mut pipe) = stdin_pipe.take() {
                let _ = pipe.write_all(prompt.as_bytes()).await;
                let _ = pipe.shutdown().await;
            }
        };
        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let finished = {
            let io = async {
                let (_, wait, stdout, stderr) =
                    tokio::join!(write_stdin, child.wait(), read_stdout, read_stderr);
                (wait, stdout, stderr)
            };
            tokio::select! {
                result = tokio::time::timeout(self.timeout(), io) => match result {
                    Ok((wait, stdout, stderr)) => Finished::Exited(wait, stdout, stderr),
                    Err(_) => Finished::TimedOut,
                },
                _ = cancel.cancelled() => Finished::Cancelled,
            }
        };

        let duration = start.elapsed();
        match finished {
            Finished::Cancelled => {
                let _ = child.kill().await;
                Err(AgentError::Cancelled)
            }
            Finished::TimedOut => {
                let _ = child.kill().await;
                Err(AgentError::TimedOut(self.timeout()))
            }
            Finished::Exited(Err(e), _, _) => Err(AgentError::RunnerFault(format!(
                "failed to wait on agent {}: {e}",
                self.config.name
            ))),
            Finished::Exited(Ok(status), stdout, stderr) => {
                if !status.success() {
                    let message = if stderr.trim().is_empty() {
                        format!("exited with {status}")
                    } else {
                        format!("exited with {status}: {}", stderr.trim())
                    };
                    let mut out = AgentOutput::failed(message, duration);
                    out.output = stdout;
                    return Ok(out);
                }

                if !self.config.emits_mutation {
                    return Ok(AgentOutput::succeeded(stdout, duration));
                }

                match serde_json::from_str::<Mutation>(stdout.trim()) {
                    Ok(mutation) => {
                        Ok(AgentOutput::succeeded(String::new(), duration).with_mutation(mutation))
                    }
                    Err(e) => {
                        let mut out =
                            AgentOutput::failed(format!("invalid mutation output: {e}"), duration);
                        out.output = stdout;
                        Ok(out)
                    }
                }
            }
        }
    }
}
