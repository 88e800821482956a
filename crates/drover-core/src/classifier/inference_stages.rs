//! Classifier stages backed by the inference service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{
    Classification, ClassificationMethod, ClassificationStage, MODEL_CONFIDENCE,
    STRUCTURED_CONFIDENCE, StageContext, StageOutcome, TaskText,
};
use crate::inference::{FunctionSpec, InferenceBackend};

const ROUTE_FUNCTION: &str = "route_task";

fn describe(task: TaskText<'_>) -> String {
    if task.description.is_empty() {
        format!("Task: {}", task.title)
    } else {
        format!("Task: {}\nDetails: {}", task.title, task.description)
    }
}

/// The `route_task` function whose `agent` argument is an enum of the
/// catalog.
pub fn route_function(catalog: &[String]) -> FunctionSpec {
    FunctionSpec {
        name: ROUTE_FUNCTION.to_string(),
        description: "Route a work item to the agent best suited to execute it.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "enum": catalog,
                    "description": "Name of the agent that should handle the task.",
                },
                "reason": {"type": "string"},
            },
            "required": ["agent"],
        }),
    }
}

/// Function-calling classification.
pub struct StructuredStage {
    backend: Arc<dyn InferenceBackend>,
}

impl StructuredStage {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ClassificationStage for StructuredStage {
    fn name(&self) -> &str {
        "structured"
    }

    async fn classify(&self, task: TaskText<'_>, ctx: &StageContext) -> StageOutcome {
        if !ctx.inference_healthy {
            return StageOutcome::Unavailable("inference service unhealthy".to_string());
        }
        if ctx.catalog.is_empty() {
            return StageOutcome::Unavailable("agent catalog is empty".to_string());
        }

        let prompt = format!(
            "Choose the agent for this work item by calling {ROUTE_FUNCTION}.\n{}",
            describe(task)
        );
        let function = route_function(&ctx.catalog);

        let args = match self.backend.call_function(&prompt, &function).await {
            Ok(Some(args)) => args,
            Ok(None) => return StageOutcome::NoMatch(format!("model did not call {ROUTE_FUNCTION}")),
            Err(e) => return StageOutcome::Unavailable(format!("{e:#}")),
        };

        match args.get("agent").and_then(|v| v.as_str()) {
            Some(agent) if ctx.allows(agent) => StageOutcome::Matched(Classification::new(
                agent,
                ClassificationMethod::Structured,
                STRUCTURED_CONFIDENCE,
            )),
            Some(agent) => StageOutcome::NoMatch(format!("inconclusive: {agent:?} is not in the catalog")),
            None => StageOutcome::NoMatch("inconclusive: no agent argument".to_string()),
        }
    }
}

/// Free-form prompt; the reply is scanned for a catalog agent name.
pub struct ModelStage {
    backend: Arc<dyn InferenceBackend>,
}

impl ModelStage {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self { backend }
    }
}

/// The catalog name appearing earliest in `answer`, longest name first on
/// ties.
pub fn find_agent_in_answer<'a>(answer: &str, catalog: &'a [String]) -> Option<&'a str> {
    let answer = answer.to_lowercase();
    catalog
        .iter()
        .filter_map(|name| answer.find(&name.to_lowercase()).map(|pos| (pos, name)))
        .min_by(|(pa, na), (pb, nb)| pa.cmp(pb).then(nb.len().cmp(&na.len())))
        .map(|(_, name)| name.as_str())
}

#[async_trait]
impl ClassificationStage for ModelStage {
    fn name(&self) -> &str {
        "model"
    }

    async fn classify(&self, task: TaskText<'_>, ctx: &StageContext) -> StageOutcome {
        if !ctx.inference_healthy {
            return StageOutcome::Unavailable("inference service unhealthy".to_string());
        }
        if ctx.catalog.is_empty() {
            return StageOutcome::Unavailable("agent catalog is empty".to_string());
        }

        let prompt = format!(
            "Which one of these agents should handle the work item below? \
             Answer with the agent name only.\nAgents: {}\n{}",
            ctx.catalog.join(", "),
            describe(task)
        );

        match self.backend.generate(&prompt).await {
            Ok(answer) => match find_agent_in_answer(&answer, &ctx.catalog) {
                Some(agent) => StageOutcome::Matched(Classification::new(
                    agent,
                    ClassificationMethod::Model,
                    MODEL_CONFIDENCE,
                )),
                None => StageOutcome::NoMatch("answer named no catalog agent".to_string()),
            },
            Err(e) => StageOutcome::Unavailable(format!("{e:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use anyhow::{Result, bail};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted backend: fixed replies, counts calls.
    struct ScriptedBackend {
        function_reply: Option<Value>,
        generate_reply: Option<String>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(function_reply: Option<Value>, generate_reply: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                function_reply,
                generate_reply: generate_reply.map(str::to_string),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn call_function(&self, _prompt: &str, _f: &FunctionSpec) -> Result<Option<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.function_reply.clone())
        }

        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.generate_reply {
                Some(r) => Ok(r.clone()),
                None => bail!("connection refused"),
            }
        }
    }

    fn ctx(healthy: bool) -> StageContext {
        StageContext {
            catalog: vec![
                "bug-fixer".into(),
                "code-generator".into(),
                "integrator".into(),
            ],
            inference_healthy: healthy,
        }
    }

    const NO_KEYWORDS: TaskText<'static> = TaskText {
        title: "Widget sync oddity",
        description: "",
    };

    #[test]
    fn route_function_enumerates_catalog() {
        let f = route_function(&["a".to_string(), "b".to_string()]);
        assert_eq!(f.name, "route_task");
        assert_eq!(f.parameters["properties"]["agent"]["enum"], json!(["a", "b"]));
    }

    #[test]
    fn answer_scanning() {
        let catalog = ctx(true).catalog;
        assert_eq!(
            find_agent_in_answer("I'd pick the Integrator here.", &catalog),
            Some("integrator")
        );
        assert_eq!(find_agent_in_answer("no idea", &catalog), None);
        assert_eq!(
            find_agent_in_answer("code-generator, or maybe bug-fixer", &catalog),
            Some("code-generator")
        );
    }

    #[tokio::test]
    async fn structured_stage_wins_when_model_calls_function() {
        let backend = ScriptedBackend::new(Some(json!({"agent": "integrator"})), Some("bug-fixer"));
        let shared: Arc<dyn InferenceBackend> = backend.clone();
        let classifier = Classifier::standard(Some(shared), "code-generator");
        let report = classifier.classify(NO_KEYWORDS, &ctx(true)).await;
        assert_eq!(report.classification.agent, "integrator");
        assert_eq!(report.classification.method, ClassificationMethod::Structured);
        assert_eq!(report.classification.confidence, 0.85);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn out_of_catalog_answer_falls_through_to_model_stage() {
        let backend = ScriptedBackend::new(Some(json!({"agent": "wizard"})), Some("bug-fixer"));
        let shared: Arc<dyn InferenceBackend> = backend;
        let classifier = Classifier::standard(Some(shared), "code-generator");
        let report = classifier.classify(NO_KEYWORDS, &ctx(true)).await;
        assert_eq!(report.classification.agent, "bug-fixer");
        assert_eq!(report.classification.method, ClassificationMethod::Model);
        assert_eq!(report.classification.confidence, 0.8);
        assert!(matches!(report.trace[1].outcome, StageOutcome::NoMatch(_)));
    }

    #[tokio::test]
    async fn unhealthy_inference_skips_stages_without_calls() {
        let backend = ScriptedBackend::new(Some(json!({"agent": "integrator"})), Some("integrator"));
        let shared: Arc<dyn InferenceBackend> = backend.clone();
        let classifier = Classifier::standard(Some(shared), "code-generator");
        let report = classifier.classify(NO_KEYWORDS, &ctx(false)).await;
        assert_eq!(report.classification.method, ClassificationMethod::Default);
        assert_eq!(report.classification.confidence, 0.5);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        let stages: Vec<&str> = report.trace.iter().map(|a| a.stage.as_str()).collect();
        assert_eq!(stages, vec!["pattern", "structured", "model", "default"]);
        assert!(matches!(report.trace[1].outcome, StageOutcome::Unavailable(_)));
        assert!(matches!(report.trace[2].outcome, StageOutcome::Unavailable(_)));
    }

    #[tokio::test]
    async fn backend_error_is_unavailable() {
        let backend = ScriptedBackend::new(None, None);
        let stage = ModelStage::new(backend);
        let outcome = stage.classify(NO_KEYWORDS, &ctx(true)).await;
        match outcome {
            StageOutcome::Unavailable(reason) => assert!(reason.contains("connection refused")),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }
}
