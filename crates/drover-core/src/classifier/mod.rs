//! Staged classification: map a task onto an agent plus a confidence.
//!
//! Stages run strictly in order and each returns a [`StageOutcome`]; the
//! first `Matched` wins. When every stage declines, the classifier falls
//! back to the configured default agent at confidence 0.5. Every attempt is
//! logged and returned in the [`ClassificationReport`] trace.

pub mod inference_stages;
pub mod pattern;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::inference::InferenceBackend;

pub use inference_stages::{ModelStage, StructuredStage};
pub use pattern::PatternStage;

pub const PATTERN_CONFIDENCE: f64 = 0.9;
pub const STRUCTURED_CONFIDENCE: f64 = 0.85;
pub const MODEL_CONFIDENCE: f64 = 0.8;
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

pub const DEFAULT_AGENT: &str = "code-generator";

/// Which stage produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Pattern,
    Structured,
    Model,
    Default,
}

impl ClassificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Structured => "structured",
            Self::Model => "model",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for ClassificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{agent, method, confidence}` with `confidence` in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub agent: String,
    pub method: ClassificationMethod,
    pub confidence: f64,
}

impl Classification {
    /// Build a classification, clamping `confidence` into `[0, 1]` (NaN
    /// becomes 0).
    pub fn new(agent: impl Into<String>, method: ClassificationMethod, confidence: f64) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            agent: agent.into(),
            method,
            confidence,
        }
    }
}

/// Result of one stage attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Matched(Classification),
    /// The stage ran but had no answer (or an inconclusive one).
    NoMatch(String),
    /// The stage could not run at all.
    Unavailable(String),
}

/// Text a stage classifies.
#[derive(Debug, Clone, Copy)]
pub struct TaskText<'a> {
    pub title: &'a str,
    pub description: &'a str,
}

/// Per-cycle facts every stage sees.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    /// Names of the agents tasks may be routed to. Empty means any.
    pub catalog: Vec<String>,
    /// Result of this cycle's inference health check.
    pub inference_healthy: bool,
}

impl StageContext {
    pub fn allows(&self, agent: &str) -> bool {
        self.catalog.is_empty() || self.catalog.iter().any(|a| a == agent)
    }
}

/// One link of the classification chain.
#[async_trait]
pub trait ClassificationStage: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, task: TaskText<'_>, ctx: &StageContext) -> StageOutcome;
}

/// One entry of the classification trace.
#[derive(Debug, Clone, PartialEq)]
pub struct StageAttempt {
    pub stage: String,
    pub outcome: StageOutcome,
}

/// The chosen classification plus every attempt that led to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationReport {
    pub classification: Classification,
    pub trace: Vec<StageAttempt>,
}

/// The ordered stage chain.
pub struct Classifier {
    stages: Vec<Box<dyn ClassificationStage>>,
    default_agent: String,
}

impl Classifier {
    pub fn new(stages: Vec<Box<dyn ClassificationStage>>, default_agent: impl Into<String>) -> Self {
        Self {
            stages,
            default_agent: default_agent.into(),
        }
    }

    /// Pattern, then structured and model inference when a backend is
    /// configured.
    pub fn standard(
        backend: Option<Arc<dyn InferenceBackend>>,
        default_agent: impl Into<String>,
    ) -> Self {
        let mut stages: Vec<Box<dyn ClassificationStage>> = vec![Box::new(PatternStage::default())];
        if let Some(backend) = backend {
            stages.push(Box::new(StructuredStage::new(Arc::clone(&backend))));
            stages.push(Box::new(ModelStage::new(backend)));
        }
        Self::new(stages, default_agent)
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn classify(&self, task: TaskText<'_>, ctx: &StageContext) -> ClassificationReport {
        let mut trace = Vec::with_capacity(self.stages.len() + 1);

        for stage in &self.stages {
            let outcome = stage.classify(task, ctx).await;
            match &outcome {
                StageOutcome::Matched(c) => {
                    debug!(
                        stage = stage.name(),
                        title = task.title,
                        agent = %c.agent,
                        confidence = c.confidence,
                        "classification stage matched"
                    );
                    let classification = c.clone();
                    trace.push(StageAttempt {
                        stage: stage.name().to_string(),
                        outcome,
                    });
                    return ClassificationReport {
                        classification,
                        trace,
                    };
                }
                StageOutcome::NoMatch(reason) => {
                    info!(stage = stage.name(), title = task.title, reason = %reason, "classification stage had no match");
                }
                StageOutcome::Unavailable(reason) => {
                    info!(stage = stage.name(), title = task.title, reason = %reason, "classification stage unavailable");
                }
            }
            trace.push(StageAttempt {
                stage: stage.name().to_string(),
                outcome,
            });
        }

        let classification = Classification::new(
            self.default_agent.clone(),
            ClassificationMethod::Default,
            DEFAULT_CONFIDENCE,
        );
        debug!(title = task.title, agent = %classification.agent, "falling back to default agent");
        trace.push(StageAttempt {
            stage: "default".to_string(),
            outcome: StageOutcome::Matched(classification.clone()),
        });
        ClassificationReport {
            classification,
            trace,
        }
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("stages", &self.stage_names())
            .field("default_agent", &self.default_agent)
            .finish()
    }
}
