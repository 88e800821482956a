//! Agent adapter interface.
//!
//! An agent is an opaque executor: it receives a task, does whatever it
//! does, and reports `{success, output, error, duration}`. It may also
//! propose a single file mutation, which the execution engine validates
//! before anything touches disk.
//!
//! ```text
//! ExecutionEngine
//!     |
//!     v
//! AgentRegistry --get("bug-fixer")--> Arc<dyn Agent>
//!     |                                    |
//!     |   execute(request, cancel) --------+
//!     |        |
//!     |        v
//!     |   AgentOutput { success, output, error, duration, mutation }
//! ```

pub mod command;
pub mod registry;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_db::models::{Priority, ProfileKind};

use crate::error::AgentError;

pub use command::{CommandAgent, CommandAgentConfig};
pub use registry::AgentRegistry;

/// What kind of work an agent does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    CodeGeneration,
    Analysis,
    Integration,
    Orchestration,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeGeneration => "code-generation",
            Self::Analysis => "analysis",
            Self::Integration => "integration",
            Self::Orchestration => "orchestration",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an agent is told about the task it runs.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub attempt: i32,
    pub runner_id: String,
    /// Root under which any proposed mutation must land.
    pub workspace_root: PathBuf,
}

impl AgentRequest {
    /// The prompt text handed to agents that take free-form input.
    pub fn prompt(&self) -> String {
        if self.description.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.description)
        }
    }
}

/// A proposed write of `content` to `path` (relative to the workspace root,
/// or absolute inside it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub path: PathBuf,
    pub content: String,
}

/// What an agent reports back.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration: Duration,
    pub mutation: Option<Mutation>,
}

impl AgentOutput {
    pub fn succeeded(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            duration,
            mutation: None,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration,
            mutation: None,
        }
    }

    pub fn with_mutation(mut self, mutation: Mutation) -> Self {
        self.mutation = Some(mutation);
        self
    }
}

/// An executing capability.
///
/// Implementations must watch `cancel` and return
/// [`AgentError::Cancelled`] promptly once it fires.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Catalog name, e.g. `"bug-fixer"`.
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Smallest runner profile this agent can run on.
    fn profile(&self) -> ProfileKind;

    async fn execute(
        &self,
        request: &AgentRequest,
        cancel: CancellationToken,
    ) -> Result<AgentOutput, AgentError>;
}

// Agents are stored as `Arc<dyn Agent>`.
const _: () = {
    fn _assert_object_safe(_: &dyn Agent) {}
};
