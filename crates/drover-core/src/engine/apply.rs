//! Backup-then-replace file writes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Where an applied mutation left things.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMutation {
    pub target: PathBuf,
    /// Copy of the previous content; `None` when the file was new.
    pub backup: Option<PathBuf>,
    /// Hex SHA-256 of the previous content.
    pub original_sha256: Option<String>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Back up the current content of `target` into `backup_dir`, then replace
/// it with `content` through a temp file and a rename in the same
/// directory.
pub async fn apply_mutation(
    target: &Path,
    content: &str,
    backup_dir: &Path,
    task_id: Uuid,
) -> Result<AppliedMutation> {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("target {} has no file name", target.display()))?
        .to_string();

    let (backup, original_sha256) = match tokio::fs::read(target).await {
        Ok(original) => {
            tokio::fs::create_dir_all(backup_dir).await.with_context(|| {
                format!("failed to create backup directory {}", backup_dir.display())
            })?;
            let backup = backup_dir.join(format!(
                "{}-{}-{file_name}.bak",
                Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
                task_id.simple()
            ));
            tokio::fs::write(&backup, &original)
                .await
                .with_context(|| format!("failed to write backup {}", backup.display()))?;
            (Some(backup), Some(sha256_hex(&original)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (None, None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", target.display()));
        }
    };

    let parent = target
        .parent()
        .with_context(|| format!("target {} has no parent", target.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let tmp = parent.join(format!(".{file_name}.drover-{}.tmp", Uuid::new_v4().simple()));
    let write = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, target).await
    };
    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("failed to replace {}", target.display()));
    }

    Ok(AppliedMutation {
        target: target.to_path_buf(),
        backup,
        original_sha256,
    })
}
