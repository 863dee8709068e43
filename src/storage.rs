//! Permanent storage and the local staging area.
//!
//! Keys are `/`-separated relative paths. Permanent layout per source:
//! `<source>/raw/<batch_path>/<filename>` for downloaded files and
//! `<source>/split/<batch_path>/<organisation>/<filename>` for split output.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, key: &str, local: &Path) -> Result<()>;
    async fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<()>;
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>>;
    /// Objects under `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

pub fn raw_key(source_id: &str, batch_path: &str, filename: &str) -> String {
    format!("{}/raw/{}/{}", source_id, batch_path, filename)
}

pub fn split_prefix(source_id: &str, batch_path: &str) -> String {
    format!("{}/split/{}", source_id, batch_path)
}

/// Filesystem-backed store rooted at `storage_dir`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("invalid storage key {}", key));
        }
        Ok(self.root.join(rel))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_file(&self, key: &str, local: &Path) -> Result<()> {
        let dest = self.resolve(key)?;
        Self::ensure_parent(&dest).await?;
        fs::copy(local, &dest)
            .await
            .with_context(|| format!("failed to store {} as {}", local.display(), key))?;
        Ok(())
    }

    async fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let dest = self.resolve(key)?;
        Self::ensure_parent(&dest).await?;
        fs::write(&dest, bytes)
            .await
            .with_context(|| format!("failed to write {}", key))?;
        Ok(())
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<()> {
        let src = self.resolve(key)?;
        Self::ensure_parent(dest).await?;
        fs::copy(&src, dest)
            .await
            .with_context(|| format!("failed to fetch {} to {}", key, dest.display()))?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let src = self.resolve(key)?;
        fs::read(&src)
            .await
            .with_context(|| format!("failed to read {}", key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let base = self.resolve(prefix)?;
        let mut out = Vec::new();
        if !fs::try_exists(&base).await.unwrap_or(false) {
            return Ok(out);
        }
        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("failed to list {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let rel = path
                    .strip_prefix(&self.root)
                    .with_context(|| format!("{} escaped storage root", path.display()))?;
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(StoredObject {
                    key,
                    size: meta.len(),
                });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete {}", key)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let path = self.resolve(prefix)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete {}", prefix)),
        }
    }
}

/// Temporary disk used while downloading, unpacking and splitting, keyed by
/// source and batch path.
#[derive(Debug, Clone)]
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn download_dir(&self, source_id: &str) -> PathBuf {
        self.root.join(source_id).join("download")
    }

    /// Unpacked raw files of one batch.
    pub fn batch_dir(&self, source_id: &str, batch_path: &str) -> PathBuf {
        self.root.join(source_id).join("batch").join(batch_path)
    }

    /// Split output of one batch, one sub-directory per organisation.
    pub fn split_dir(&self, source_id: &str, batch_path: &str) -> PathBuf {
        self.root.join(source_id).join("split").join(batch_path)
    }

    pub async fn remove_batch(&self, source_id: &str, batch_path: &str) -> Result<()> {
        for dir in [
            self.batch_dir(source_id, batch_path),
            self.split_dir(source_id, batch_path),
        ] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to remove {}", dir.display()))
                }
            }
        }
        Ok(())
    }
}
