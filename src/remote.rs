//! Remote drop-off listing and transfer.
use crate::model::RemoteFile;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Files currently offered, sorted by name.
    async fn list(&self) -> Result<Vec<RemoteFile>>;

    /// Copy `file` to `dest`, overwriting anything already there.
    async fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<()>;
}

/// A mounted drop directory, walked recursively.
#[derive(Debug, Clone)]
pub struct LocalDropSource {
    root: PathBuf,
}

impl LocalDropSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RemoteSource for LocalDropSource {
    async fn list(&self) -> Result<Vec<RemoteFile>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("failed to list remote directory {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                // partial uploads
                if name.starts_with('.') || name.ends_with(".download") {
                    continue;
                }
                files.push(RemoteFile {
                    name,
                    size: meta.len(),
                    modified: meta.modified().ok().map(DateTime::<Utc>::from),
                    path: path.to_string_lossy().to_string(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
        Ok(files)
    }

    async fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&file.path, dest)
            .await
            .with_context(|| format!("failed to fetch {}", file.path))?;
        Ok(())
    }
}
