//! Keyword table classification.

use async_trait::async_trait;

use super::{
    Classification, ClassificationMethod, ClassificationStage, PATTERN_CONFIDENCE, StageContext,
    StageOutcome, TaskText,
};

/// One row of the keyword table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternRule {
    pub keywords: Vec<String>,
    pub agent: String,
}

impl PatternRule {
    pub fn new(keywords: &[&str], agent: &str) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            agent: agent.to_string(),
        }
    }

    fn matches(&self, words: &[&str]) -> bool {
        self.keywords
            .iter()
            .any(|k| words.iter().any(|w| w.starts_with(k.as_str())))
    }
}

/// The built-in table. Order matters: the first matching row wins, so
/// `test` sits above `schedule` and `fix` above `debug`.
pub fn default_rules() -> Vec<PatternRule> {
    vec![
        PatternRule::new(&["fix", "bug", "crash", "error", "repair"], "bug-fixer"),
        PatternRule::new(&["test", "coverage"], "test-writer"),
        PatternRule::new(
            &["investigate", "diagnose", "debug", "analyze", "overheat", "monitor"],
            "diagnostician",
        ),
        PatternRule::new(&["deploy", "integrate", "connect", "api", "webhook"], "integrator"),
        PatternRule::new(&["refactor", "implement"], "code-generator"),
        PatternRule::new(&["plan", "coordinate", "orchestrate", "schedule"], "coordinator"),
        PatternRule::new(&["document", "docs", "readme"], "doc-writer"),
    ]
}

/// Lowercased alphanumeric words of `text`.
fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Deterministic keyword lookup, title first, then description.
///
/// A keyword matches the start of a word, so `test` hits "tests" but `bug`
/// does not hit "debug". Rows naming an agent outside the catalog are
/// skipped.
#[derive(Debug, Clone)]
pub struct PatternStage {
    rules: Vec<PatternRule>,
}

impl PatternStage {
    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    fn lookup(&self, text: &str, ctx: &StageContext) -> Option<&PatternRule> {
        let owned = words(text);
        let words: Vec<&str> = owned.iter().map(String::as_str).collect();
        self.rules
            .iter()
            .filter(|r| ctx.allows(&r.agent))
            .find(|r| r.matches(&words))
    }
}

impl Default for PatternStage {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

#[async_trait]
impl ClassificationStage for PatternStage {
    fn name(&self) -> &str {
        "pattern"
    }

    async fn classify(&self, task: TaskText<'_>, ctx: &StageContext) -> StageOutcome {
        let rule = self
            .lookup(task.title, ctx)
            .or_else(|| self.lookup(task.description, ctx));
        match rule {
            Some(rule) => StageOutcome::Matched(Classification::new(
                rule.agent.clone(),
                ClassificationMethod::Pattern,
                PATTERN_CONFIDENCE,
            )),
            None => StageOutcome::NoMatch("no keyword matched".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn agent_for(title: &str, description: &str) -> Option<String> {
        let stage = PatternStage::default();
        match stage
            .classify(TaskText { title, description }, &StageContext::default())
            .await
        {
            StageOutcome::Matched(c) => {
                assert_eq!(c.confidence, PATTERN_CONFIDENCE);
                assert_eq!(c.method, ClassificationMethod::Pattern);
                Some(c.agent)
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn routes_the_canonical_examples() {
        assert_eq!(agent_for("Fix dashboard crash", "").await.as_deref(), Some("bug-fixer"));
        assert_eq!(
            agent_for("Add unit tests for scheduler", "").await.as_deref(),
            Some("test-writer")
        );
        assert_eq!(
            agent_for("Investigate GPU overheating", "").await.as_deref(),
            Some("diagnostician")
        );
    }

    #[tokio::test]
    async fn keywords_match_word_starts_only() {
        // "debug" must not trip the bug-fixer row.
        assert_eq!(
            agent_for("Debug flaky network", "").await.as_deref(),
            Some("diagnostician")
        );
        // "prefix" contains "fix" but not at a word start.
        assert_eq!(agent_for("Prefix handling", "").await, None);
    }

    #[tokio::test]
    async fn description_is_consulted_after_title() {
        assert_eq!(
            agent_for("Widget thing", "needs a README section").await.as_deref(),
            Some("doc-writer")
        );
        // Title wins over description.
        assert_eq!(
            agent_for("Deploy service", "fix the crash first").await.as_deref(),
            Some("integrator")
        );
    }

    #[tokio::test]
    async fn uncatalogued_agents_are_skipped() {
        let stage = PatternStage::default();
        let ctx = StageContext {
            catalog: vec!["diagnostician".into()],
            inference_healthy: false,
        };
        let outcome = stage
            .classify(
                TaskText {
                    title: "Fix crash and investigate",
                    description: "",
                },
                &ctx,
            )
            .await;
        match outcome {
            StageOutcome::Matched(c) => assert_eq!(c.agent, "diagnostician"),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn word_splitting() {
        assert_eq!(words("Fix: API-key  crash!"), vec!["fix", "api", "key", "crash"]);
    }
}
