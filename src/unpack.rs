//! Copy a batch's downloaded files from permanent storage into staging.
use crate::db::{self, Pool};
use crate::error::IngestError;
use crate::model::Batch;
use crate::storage::{raw_key, ObjectStore, Staging};
use anyhow::Context;
use std::path::PathBuf;
use tracing::{debug, instrument};

/// One raw file of a batch on staging disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub filename: String,
    pub file_type: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UnpackedBatch {
    pub batch: Batch,
    pub dir: PathBuf,
    pub files: Vec<StagedFile>,
}

impl UnpackedBatch {
    pub fn file_of_type(&self, file_type: &str) -> Option<&StagedFile> {
        self.files.iter().find(|f| f.file_type == file_type)
    }
}

/// A batch with a file that never finished downloading is deferred rather
/// than unpacked partially.
#[instrument(skip_all, fields(batch_id = batch.id))]
pub async fn unpack_batch(
    pool: &Pool,
    store: &dyn ObjectStore,
    staging: &Staging,
    batch: &Batch,
) -> Result<UnpackedBatch, IngestError> {
    let dir = staging.batch_dir(&batch.source_id, &batch.local_path);
    if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("failed to clear {}", dir.display()))?;
    }
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let mut files = Vec::new();
    for file in db::get_batch_files(pool, batch.id).await? {
        if file.is_deleted {
            continue;
        }
        if !file.is_downloaded {
            return Err(IngestError::validation(
                &batch.batch_identifier,
                format!("{} has not been downloaded", file.filename),
            ));
        }
        let path = dir.join(&file.filename);
        store
            .get_to_file(&raw_key(&batch.source_id, &batch.local_path, &file.filename), &path)
            .await?;
        debug!(filename = %file.filename, "unpacked");
        files.push(StagedFile {
            filename: file.filename,
            file_type: file.file_type,
            path,
        });
    }

    Ok(UnpackedBatch {
        batch: batch.clone(),
        dir,
        files,
    })
}
