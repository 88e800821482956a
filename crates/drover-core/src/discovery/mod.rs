//! Discovery: pull candidate tasks from every source, deduplicate them and
//! order them by priority.
//!
//! Each adapter runs on its own tokio task under a timeout, so an adapter
//! that errors, hangs or panics is reported and skipped without affecting
//! the others. Reading from adapters is the only side effect.

pub mod command;
pub mod file;
pub mod source;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use drover_db::models::{Priority, SourceKind};

use crate::error::OrchestrationError;

pub use command::CommandSource;
pub use file::FileSource;
pub use source::{SourceAdapter, SourceItem};

pub const DEFAULT_PER_SOURCE_LIMIT: usize = 10;
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters of the normalized title that take part in deduplication.
pub const DEDUP_PREFIX_CHARS: usize = 50;

/// Trim, collapse whitespace runs to one space, lowercase.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// The first [`DEDUP_PREFIX_CHARS`] characters of the normalized title.
pub fn dedup_key(title: &str) -> String {
    normalize_title(title)
        .chars()
        .take(DEDUP_PREFIX_CHARS)
        .collect()
}

/// A deduplicated candidate, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTask {
    pub title: String,
    pub description: String,
    /// `<source name>` or `<source name>/<item id>`.
    pub source_id: String,
    pub source_kind: SourceKind,
    pub priority: Priority,
    pub dedup_key: String,
}

impl DiscoveredTask {
    fn from_item(source: &str, kind: SourceKind, item: SourceItem) -> Self {
        let priority = item
            .priority_hint
            .as_deref()
            .map(Priority::from_hint)
            .unwrap_or(Priority::Medium);
        let source_id = if item.source_id.is_empty() {
            source.to_string()
        } else {
            format!("{source}/{}", item.source_id)
        };
        Self {
            dedup_key: dedup_key(&item.title),
            title: item.title.trim().to_string(),
            description: item.description,
            source_id,
            source_kind: kind,
            priority,
        }
    }
}

/// What happened to one source this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    /// `taken` items kept, `truncated` dropped by the per-source limit.
    Listed { taken: usize, truncated: usize },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub source: String,
    pub kind: SourceKind,
    pub outcome: SourceOutcome,
}

/// Output of one discovery round.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryBatch {
    pub tasks: Vec<DiscoveredTask>,
    pub reports: Vec<SourceReport>,
}

impl DiscoveryBatch {
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, SourceOutcome::Failed(_)))
    }
}

/// Deduplicate by `dedup_key` and sort by priority.
///
/// The first occurrence of a key keeps its position and fields but takes
/// the most urgent priority seen among its duplicates. The sort is stable,
/// so equal priorities keep discovery order. Applying this twice gives the
/// same result as applying it once.
pub fn merge(candidates: Vec<DiscoveredTask>) -> Vec<DiscoveredTask> {
    let mut merged: Vec<DiscoveredTask> = Vec::with_capacity(candidates.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for candidate in candidates {
        if candidate.dedup_key.is_empty() {
            continue;
        }
        match index.get(&candidate.dedup_key) {
            Some(&i) => {
                let kept = &mut merged[i];
                if candidate.priority.rank() < kept.priority.rank() {
                    kept.priority = candidate.priority;
                }
            }
            None => {
                index.insert(candidate.dedup_key.clone(), merged.len());
                merged.push(candidate);
            }
        }
    }

    merged.sort_by_key(|t| t.priority.rank());
    merged
}

/// Fans out to the configured sources.
pub struct DiscoveryAggregator {
    sources: Vec<Arc<dyn SourceAdapter>>,
    per_source_limit: usize,
    source_timeout: Duration,
}

impl DiscoveryAggregator {
    pub fn new(sources: Vec<Arc<dyn SourceAdapter>>) -> Self {
        Self {
            sources,
            per_source_limit: DEFAULT_PER_SOURCE_LIMIT,
            source_timeout: DEFAULT_SOURCE_TIMEOUT,
        }
    }

    pub fn with_per_source_limit(mut self, limit: usize) -> Self {
        self.per_source_limit = limit;
        self
    }

    pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = timeout;
        self
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub async fn discover(&self) -> DiscoveryBatch {
        let handles: Vec<_> = self
            .sources
            .iter()
            .map(|source| {
                let source = Arc::clone(source);
                let timeout = self.source_timeout;
                tokio::spawn(async move { tokio::time::timeout(timeout, source.list()).await })
            })
            .collect();

        let mut candidates = Vec::new();
        let mut reports = Vec::with_capacity(self.sources.len());

        for (source, handle) in self.sources.iter().zip(handles) {
            let listed = match handle.await {
                Ok(Ok(Ok(items))) => Ok(items),
                Ok(Ok(Err(e))) => Err(format!("{e:#}")),
                Ok(Err(_)) => Err(format!("timed out after {:?}", self.source_timeout)),
                Err(join) if join.is_panic() => Err("adapter panicked".to_string()),
                Err(join) => Err(format!("adapter task failed: {join}")),
            };

            let outcome = match listed {
                Ok(mut items) => {
                    let truncated = items.len().saturating_sub(self.per_source_limit);
                    items.truncate(self.per_source_limit);
                    let taken = items.len();
                    candidates.extend(
                        items
                            .into_iter()
                            .map(|item| DiscoveredTask::from_item(source.name(), source.kind(), item)),
                    );
                    info!(source = source.name(), taken, truncated, "source listed");
                    SourceOutcome::Listed { taken, truncated }
                }
                Err(reason) => {
                    let err = OrchestrationError::SourceUnavailable {
                        source_id: source.name().to_string(),
                        reason: reason.clone(),
                    };
                    warn!(source = source.name(), error = %err, "skipping source");
                    SourceOutcome::Failed(reason)
                }
            };

            reports.push(SourceReport {
                source: source.name().to_string(),
                kind: source.kind(),
                outcome,
            });
        }

        DiscoveryBatch {
            tasks: merge(candidates),
            reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, bail};
    use async_trait::async_trait;

    struct StaticSource {
        name: &'static str,
        items: Vec<SourceItem>,
    }

    #[async_trait]
    impl SourceAdapter for StaticSource {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Manual
        }

        async fn list(&self) -> Result<Vec<SourceItem>> {
            Ok(self.items.clone())
        }
    }

    struct BrokenSource(&'static str);

    #[async_trait]
    impl SourceAdapter for BrokenSource {
        fn name(&self) -> &str {
            self.0
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Monitoring
        }

        async fn list(&self) -> Result<Vec<SourceItem>> {
            match self.0 {
                "panics" => panic!("adapter bug"),
                "hangs" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(vec![])
                }
                _ => bail!("connection refused"),
            }
        }
    }

    fn task(title: &str, priority: Priority) -> DiscoveredTask {
        DiscoveredTask {
            title: title.to_string(),
            description: String::new(),
            source_id: "s".to_string(),
            source_kind: SourceKind::Manual,
            priority,
            dedup_key: dedup_key(title),
        }
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_title("  Fix   the\tCrash \n"), "fix the crash");
        assert_eq!(dedup_key("Fix crash"), dedup_key("  FIX   CRASH"));
    }

    #[test]
    fn dedup_key_truncates_by_characters() {
        let title = "é".repeat(60);
        let key = dedup_key(&title);
        assert_eq!(key.chars().count(), 50);
        // Only the first 50 characters matter.
        assert_eq!(dedup_key(&format!("{}x", "a".repeat(50))), dedup_key(&"a".repeat(51)));
    }

    #[test]
    fn priority_order_is_stable() {
        let out = merge(vec![
            task("a", Priority::Low),
            task("b", Priority::Critical),
            task("c", Priority::High),
        ]);
        let priorities: Vec<_> = out.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![Priority::Critical, Priority::High, Priority::Low]);

        let out = merge(vec![
            task("first", Priority::Medium),
            task("second", Priority::Medium),
            task("third", Priority::Medium),
        ]);
        let titles: Vec<_> = out.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
    }

    #[test]
    fn duplicates_keep_first_and_take_highest_priority() {
        let mut dup = task("FIX   crash", Priority::Critical);
        dup.description = "second copy".into();
        let out = merge(vec![
            task("Fix crash", Priority::Low),
            task("other", Priority::High),
            dup,
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].title, "Fix crash");
        assert_eq!(out[0].priority, Priority::Critical);
        assert_eq!(out[0].description, "");
    }

    #[test]
    fn merge_is_idempotent() {
        let input = vec![
            task("x", Priority::Low),
            task("y", Priority::High),
            task("X", Priority::Medium),
            task("z", Priority::High),
        ];
        let once = merge(input);
        let twice = merge(once.clone());
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn failing_sources_are_isolated() {
        let sources: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(BrokenSource("errors")),
            Arc::new(BrokenSource("panics")),
            Arc::new(BrokenSource("hangs")),
            Arc::new(StaticSource {
                name: "good",
                items: vec![SourceItem::new("Fix dashboard crash").with_priority("high")],
            }),
        ];
        let batch = DiscoveryAggregator::new(sources)
            .with_source_timeout(Duration::from_millis(200))
            .discover()
            .await;

        assert_eq!(batch.tasks.len(), 1);
        assert_eq!(batch.tasks[0].priority, Priority::High);
        assert_eq!(batch.tasks[0].source_id, "good");
        assert_eq!(batch.failed_sources().count(), 3);
        match &batch.reports[1].outcome {
            SourceOutcome::Failed(reason) => assert!(reason.contains("panicked")),
            other => panic!("unexpected {other:?}"),
        }
        match &batch.reports[2].outcome {
            SourceOutcome::Failed(reason) => assert!(reason.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn per_source_limit_truncates() {
        let items = (0..15).map(|i| SourceItem::new(format!("item {i}"))).collect();
        let sources: Vec<Arc<dyn SourceAdapter>> =
            vec![Arc::new(StaticSource { name: "bulk", items })];
        let batch = DiscoveryAggregator::new(sources).discover().await;
        assert_eq!(batch.tasks.len(), 10);
        assert_eq!(
            batch.reports[0].outcome,
            SourceOutcome::Listed {
                taken: 10,
                truncated: 5
            }
        );
    }

    #[tokio::test]
    async fn merged_across_sources() {
        let sources: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(StaticSource {
                name: "tracker",
                items: vec![SourceItem::new("Add unit tests for scheduler").with_priority("low")],
            }),
            Arc::new(StaticSource {
                name: "scanner",
                items: vec![
                    SourceItem::new("add unit tests for  scheduler").with_priority("p1"),
                    SourceItem::new("Investigate GPU overheating").with_priority("critical"),
                ],
            }),
        ];
        let batch = DiscoveryAggregator::new(sources).discover().await;
        let titles: Vec<_> = batch.tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Investigate GPU overheating", "Add unit tests for scheduler"]
        );
        assert_eq!(batch.tasks[1].priority, Priority::High);
        assert_eq!(batch.tasks[1].source_id, "tracker");
    }
}
