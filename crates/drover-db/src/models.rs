use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Text-backed enums
// ---------------------------------------------------------------------------

/// Error returned when a stored or user-supplied string does not name a
/// variant of one of the text-backed enums below.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseEnumError {
    /// Which enum was being parsed (e.g. "task status").
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

/// Declare an enum stored as snake_case TEXT, with `as_str`, `Display`,
/// `FromStr` and an `ALL` list in declaration order.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
        #[sqlx(rename_all = "snake_case")]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The stored text form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(ParseEnumError {
                        kind: $label,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// Lifecycle status of a task.
    ///
    /// ```text
    /// pending -> in_progress -> completed | failed
    /// failed -> pending          (retry, while attempts < max_attempts)
    /// in_progress -> pending     (stale reset, runner fault requeue)
    /// ```
    TaskStatus, "task status" {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
    }
}

text_enum! {
    /// Task priority. Declaration order is urgency order.
    Priority, "priority" {
        Critical => "critical",
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

impl Priority {
    /// Sort rank: 0 for critical up to 3 for low.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    /// Map a free-form priority hint from a source onto a priority.
    ///
    /// Accepts the canonical names plus the common `p0`..`p3` and
    /// `urgent`/`blocker`/`minor` spellings. Anything unrecognised is
    /// treated as `medium`.
    pub fn from_hint(hint: &str) -> Self {
        let hint = hint.trim().to_ascii_lowercase();
        if let Ok(p) = hint.parse() {
            return p;
        }
        match hint.as_str() {
            "p0" | "urgent" | "blocker" | "highest" | "sev1" => Self::Critical,
            "p1" | "major" | "important" | "sev2" => Self::High,
            "p3" | "minor" | "trivial" | "lowest" | "sev4" => Self::Low,
            _ => Self::Medium,
        }
    }
}

text_enum! {
    /// What kind of system a task was discovered in.
    SourceKind, "source kind" {
        IssueTracker => "issue_tracker",
        CodeScan => "code_scan",
        TodoFile => "todo_file",
        Monitoring => "monitoring",
        Manual => "manual",
    }
}

text_enum! {
    /// Resource profile of a runner. Declaration order is capability order,
    /// so the derived `Ord` answers "is this profile at least as capable".
    #[derive(PartialOrd, Ord)]
    ProfileKind, "runner profile" {
        Light => "light",
        Standard => "standard",
        GpuLight => "gpu_light",
        GpuHeavy => "gpu_heavy",
        GpuMax => "gpu_max",
    }
}

text_enum! {
    /// Status of a runner instance.
    RunnerStatus, "runner status" {
        Idle => "idle",
        Running => "running",
        Error => "error",
    }
}

text_enum! {
    /// Category of the last failure recorded against a task.
    FailureKind, "failure kind" {
        ExecutionError => "execution_error",
        ValidationFailure => "validation_failure",
        RunnerFault => "runner_fault",
        Cancelled => "cancelled",
        /// The task sat in `in_progress` past the staleness threshold.
        Stale => "stale",
    }
}

text_enum! {
    /// Outcome written to the execution log.
    ExecutionOutcome, "execution outcome" {
        Success => "success",
        ExecutionError => "execution_error",
        ValidationFailure => "validation_failure",
        RunnerFault => "runner_fault",
        Cancelled => "cancelled",
    }
}

impl From<FailureKind> for ExecutionOutcome {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::ExecutionError | FailureKind::Stale => Self::ExecutionError,
            FailureKind::ValidationFailure => Self::ValidationFailure,
            FailureKind::RunnerFault => Self::RunnerFault,
            FailureKind::Cancelled => Self::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A discovered unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Normalized title prefix; unique across the store.
    pub dedup_key: String,
    /// Monotonic discovery order, used to keep priority sorting stable.
    pub discovery_seq: i64,
    pub assigned_agent: Option<String>,
    pub classification_method: Option<String>,
    pub classification_confidence: Option<f64>,
    pub assigned_runner: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub failure_kind: Option<FailureKind>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether the task can never run again.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed => true,
            TaskStatus::Failed => self.attempts >= self.max_attempts,
            TaskStatus::Pending | TaskStatus::InProgress => false,
        }
    }
}

/// One row of the append-only transition log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskTransition {
    pub id: i64,
    pub task_id: Uuid,
    /// `None` for the creation record.
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub attempts: i32,
    pub runner_id: Option<String>,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted view of a runner instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Runner {
    pub id: String,
    pub profile: ProfileKind,
    pub gpu_id: Option<i64>,
    pub status: RunnerStatus,
    pub current_task: Option<Uuid>,
    pub tasks_completed: i64,
    pub recovery_attempts: i32,
    pub updated_at: DateTime<Utc>,
}

/// One execution attempt, as recorded in the execution log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
    pub id: i64,
    pub task_id: Uuid,
    pub agent: String,
    pub runner_id: Option<String>,
    pub attempt: i32,
    pub outcome: ExecutionOutcome,
    pub duration_ms: i64,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// A single health check observation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HealthRecord {
    pub id: i64,
    pub component: String,
    pub healthy: bool,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// A corrective policy change made by the adaptation loop.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AdaptationEntry {
    pub id: i64,
    pub kind: String,
    pub reason: String,
    pub action: String,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
