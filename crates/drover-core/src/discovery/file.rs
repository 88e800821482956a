//! A TOML inbox file of `[[task]]` entries.
//!
//! ```toml
//! [[task]]
//! title = "Fix dashboard crash"
//! priority = "high"
//! description = "null deref when the widget list is empty"
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use drover_db::models::SourceKind;

use super::source::{SourceAdapter, SourceItem};

#[derive(Debug, Deserialize)]
struct Inbox {
    #[serde(default)]
    task: Vec<SourceItem>,
}

/// Reads tasks from a TOML file on every `list()` call.
#[derive(Debug, Clone)]
pub struct FileSource {
    name: String,
    kind: SourceKind,
    path: PathBuf,
}

impl FileSource {
    pub fn new(name: impl Into<String>, kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn list(&self) -> Result<Vec<SourceItem>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read inbox {}", self.path.display()))?;
        let inbox: Inbox = toml::from_str(&contents)
            .with_context(|| format!("failed to parse inbox {}", self.path.display()))?;

        let items = inbox
            .task
            .into_iter()
            .enumerate()
            .map(|(i, mut item)| {
                if item.source_id.is_empty() {
                    item.source_id = format!("{}#{}", self.path.display(), i + 1);
                }
                item
            })
            .collect();
        Ok(items)
    }
}
