//! A source backed by an external command printing JSON.
//!
//! Output is either one JSON array of items or one JSON object per line.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use drover_db::models::SourceKind;

use super::source::{SourceAdapter, SourceItem};

#[derive(Debug, Clone)]
pub struct CommandSource {
    name: String,
    kind: SourceKind,
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(
        name: impl Into<String>,
        kind: SourceKind,
        command: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            command: command.into(),
            args,
            timeout,
        }
    }
}

/// Parse a JSON array or JSON lines.
pub fn parse_items(stdout: &str) -> Result<Vec<SourceItem>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("failed to parse JSON array of items");
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("failed to parse item on line {}", i + 1))
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for CommandSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn list(&self) -> Result<Vec<SourceItem>> {
        let child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to run source command {}", self.command))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!("source command {} timed out after {:?}", self.command, self.timeout)
            })?
            .with_context(|| format!("failed to wait on source command {}", self.command))?;

        if !output.status.success() {
            bail!(
                "source command {} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_items(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> CommandSource {
        CommandSource::new(
            "sh",
            SourceKind::IssueTracker,
            "sh",
            vec!["-c".into(), script.into()],
            timeout,
        )
    }

    #[test]
    fn parses_array_and_lines() {
        let items = parse_items(r#"[{"title":"a","priority_hint":"p0"},{"title":"b"}]"#).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].priority_hint.as_deref(), Some("p0"));

        let items = parse_items("{\"title\":\"a\"}\n\n{\"title\":\"b\",\"source_id\":\"GH-2\"}\n")
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].source_id, "GH-2");

        assert!(parse_items("   ").unwrap().is_empty());
        assert!(parse_items("not json").is_err());
    }

    #[tokio::test]
    async fn runs_command() {
        let source = sh(r#"echo '{"title":"Fix crash","priority":"urgent"}'"#, Duration::from_secs(5));
        let items = source.list().await.unwrap();
        assert_eq!(items, vec![SourceItem::new("Fix crash").with_priority("urgent")]);
    }

    #[tokio::test]
    async fn failing_command_is_error() {
        let source = sh("exit 2", Duration::from_secs(5));
        assert!(source.list().await.is_err());
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let source = sh("sleep 10", Duration::from_millis(200));
        let err = source.list().await.unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
    }
}
