//! The source adapter contract.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use drover_db::models::SourceKind;

/// One candidate unit of work as a source reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Free-form priority (`critical`, `p1`, `urgent`, ...).
    #[serde(default, alias = "priority")]
    pub priority_hint: Option<String>,
    /// Identifier of the item inside its source (issue number, file:line).
    #[serde(default)]
    pub source_id: String,
}

impl SourceItem {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority_hint: None,
            source_id: String::new(),
        }
    }

    pub fn with_priority(mut self, hint: impl Into<String>) -> Self {
        self.priority_hint = Some(hint.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Read-only access to one task source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable identifier used in logs and reports.
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    async fn list(&self) -> Result<Vec<SourceItem>>;
}
