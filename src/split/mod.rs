//! Per-organisation splitting of an unpacked batch.
//!
//! - `csv_split` / `csv_join`: file-level partition and recombination.
//! - `engine`: the directory-level algorithm over a whole batch.
//!
//! [`split_batch`] runs the engine, resolves organisation identity, labels
//! bulk/delta and replaces the batch's splits in storage and the database.

pub mod csv_join;
pub mod csv_split;
pub mod engine;

use crate::classify;
use crate::config::SourceConfig;
use crate::db::{self, Pool};
use crate::error::IngestError;
use crate::model::{Batch, BatchSplit, NewSplit};
use crate::storage::{split_prefix, ObjectStore, Staging};
use crate::unpack::UnpackedBatch;
use crate::vendor::VendorStrategy;
use anyhow::Context;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, instrument};

pub use engine::{FileAction, OrgDirectory};

/// Vendor column policy for the splitter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitPolicy {
    /// Column naming the owning organisation.
    pub org_column: String,
    /// Secondary column keeping fragments in causal order.
    pub order_column: Option<String>,
    /// File types copied whole into every organisation.
    pub never_split: Vec<String>,
    pub ignore: Vec<String>,
}

pub struct SplitContext<'a> {
    pub pool: &'a Pool,
    pub store: &'a dyn ObjectStore,
    pub staging: &'a Staging,
    pub source: &'a SourceConfig,
    pub strategy: &'a VendorStrategy,
}

struct ResolvedOrg {
    dir: OrgDirectory,
    code: String,
    is_bulk: bool,
}

#[instrument(skip_all, fields(source = %ctx.source.id, batch_id = unpacked.batch.id))]
pub async fn split_batch(
    ctx: &SplitContext<'_>,
    unpacked: &UnpackedBatch,
    last_complete: Option<&Batch>,
) -> Result<Vec<BatchSplit>, IngestError> {
    let batch = &unpacked.batch;

    // directory name -> organisation code, for carrying organisations over
    let mut carried: BTreeMap<String, String> = BTreeMap::new();
    if let Some(last) = last_complete {
        for split in db::get_splits_for_batch(ctx.pool, last.id).await? {
            carried.insert(split.directory_name().to_string(), split.organisation_id.clone());
        }
    }

    let policy = ctx.strategy.split_policy.clone();
    let files = unpacked.files.clone();
    let previous: Vec<String> = carried.keys().cloned().collect();
    let out_dir = ctx.staging.split_dir(&batch.source_id, &batch.local_path);
    let dirs = tokio::task::spawn_blocking(move || {
        engine::split_files(&policy, &files, &previous, &out_dir)
    })
    .await
    .map_err(|err| IngestError::fatal(format!("split task failed: {}", err)))?
    .with_context(|| format!("failed to split batch {}", batch.batch_identifier))?;

    let mut resolved = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let code = match &dir.org_value {
            Some(value) => match ctx.strategy.resolve_organisation(ctx.pool, value).await? {
                Some(mapping) => mapping.code,
                None => {
                    return Err(IngestError::fatal(format!(
                        "organisation {} in batch {} of {} has no mapping",
                        value, batch.batch_identifier, ctx.source.id
                    )))
                }
            },
            None => carried.get(&dir.dir_name).cloned().ok_or_else(|| {
                IngestError::fatal(format!(
                    "carried organisation directory {} has no previous split",
                    dir.dir_name
                ))
            })?,
        };
        if ctx.source.ignored_organisations.iter().any(|o| o == &code) {
            info!(organisation = %code, "dropping split for ignored organisation");
            continue;
        }
        let is_bulk = classify::classify_split(ctx.strategy.bulk.as_ref(), unpacked, &dir.path, &code);
        resolved.push(ResolvedOrg { dir, code, is_bulk });
    }

    let prefix = split_prefix(&batch.source_id, &batch.local_path);
    let removed = db::delete_splits(ctx.pool, batch.id).await?;
    ctx.store.delete_prefix(&prefix).await?;
    if removed > 0 {
        debug!(removed, "replaced previous splits");
    }

    for org in &resolved {
        let storage_path = format!("{}/{}", prefix, org.dir.dir_name);
        upload_dir(ctx.store, &org.dir.path, &storage_path).await?;
        db::add_split(
            ctx.pool,
            &NewSplit {
                batch_id: batch.id,
                source_id: batch.source_id.clone(),
                organisation_id: org.code.clone(),
                storage_path,
                is_bulk: org.is_bulk,
            },
        )
        .await?;
    }
    info!(splits = resolved.len(), "batch split");

    Ok(db::get_splits_for_batch(ctx.pool, batch.id).await?)
}

/// Remove a batch's splits, used when a split batch fails post-split checks.
pub async fn discard_splits(
    pool: &Pool,
    store: &dyn ObjectStore,
    batch: &Batch,
) -> Result<(), IngestError> {
    db::delete_splits(pool, batch.id).await?;
    store
        .delete_prefix(&split_prefix(&batch.source_id, &batch.local_path))
        .await?;
    Ok(())
}

async fn upload_dir(store: &dyn ObjectStore, dir: &Path, storage_path: &str) -> anyhow::Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        store
            .put_file(&format!("{}/{}", storage_path, name), &entry.path())
            .await?;
    }
    Ok(())
}
