//! Record inbound files against their batches and transfer the new ones.
//!
//! Registration and the downloaded flag are the two commit points: a crash
//! between them only repeats that one transfer on the next run.

use crate::db::{self, Pool};
use crate::error::IngestError;
use crate::model::RemoteFile;
use crate::remote::RemoteSource;
use crate::storage::{raw_key, ObjectStore, Staging};
use crate::vendor::{FilenameParser, ParsedFilename};
use anyhow::Context;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntakeReport {
    pub listed: usize,
    pub downloaded: usize,
    pub already_downloaded: usize,
    pub not_needed: usize,
    /// Unknown files recorded for the first time in this run.
    pub newly_unknown: Vec<String>,
}

pub struct IntakeContext<'a> {
    pub pool: &'a Pool,
    pub source_id: &'a str,
    pub remote: &'a dyn RemoteSource,
    pub parser: &'a dyn FilenameParser,
    pub staging: &'a Staging,
    pub store: &'a dyn ObjectStore,
}

#[instrument(skip_all, fields(source = %ctx.source_id))]
pub async fn run_intake(ctx: &IntakeContext<'_>) -> Result<IntakeReport, IngestError> {
    let files = ctx.remote.list().await.map_err(|err| {
        IngestError::Transport(format!("listing remote files for {}: {:#}", ctx.source_id, err))
    })?;
    let mut report = IntakeReport {
        listed: files.len(),
        ..Default::default()
    };

    for file in &files {
        let size = i64::try_from(file.size).unwrap_or(i64::MAX);
        let (batch_identifier, file_type) = match ctx.parser.parse_filename(file) {
            Ok(ParsedFilename::Batch {
                batch_identifier,
                file_type,
            }) => (batch_identifier, file_type),
            Ok(ParsedFilename::NotNeeded) => {
                debug!(filename = %file.name, "file not needed");
                report.not_needed += 1;
                continue;
            }
            Err(IngestError::Parse { filename, reason }) => {
                warn!(filename = %filename, reason = %reason, "unrecognised file");
                if db::record_unknown_file(ctx.pool, ctx.source_id, &file.name, size, file.modified)
                    .await?
                {
                    report.newly_unknown.push(file.name.clone());
                }
                continue;
            }
            Err(other) => return Err(other),
        };

        let registration = db::register_file(
            ctx.pool,
            ctx.source_id,
            &batch_identifier,
            &file_type,
            &file.name,
            size,
            file.modified,
        )
        .await
        .with_context(|| format!("registering {}", file.name))?;
        if registration.already_downloaded {
            report.already_downloaded += 1;
            continue;
        }

        transfer(ctx, file, &registration.batch_path).await?;
        db::mark_downloaded(ctx.pool, registration.file_id).await?;
        report.downloaded += 1;
        info!(filename = %file.name, batch_id = registration.batch_id, "downloaded");
    }

    Ok(report)
}

/// Fetch into `<name>.download`, rename into place, then store permanently.
async fn transfer(
    ctx: &IntakeContext<'_>,
    file: &RemoteFile,
    batch_path: &str,
) -> Result<(), IngestError> {
    let dir = ctx.staging.download_dir(ctx.source_id);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let partial = dir.join(format!("{}.download", file.name));
    let done = dir.join(&file.name);

    ctx.remote.fetch(file, &partial).await.map_err(|err| {
        IngestError::Transport(format!("fetching {} for {}: {:#}", file.name, ctx.source_id, err))
    })?;
    fs::rename(&partial, &done)
        .await
        .with_context(|| format!("failed to finalise {}", file.name))?;
    ctx.store
        .put_file(&raw_key(ctx.source_id, batch_path, &file.name), &done)
        .await?;
    fs::remove_file(&done)
        .await
        .with_context(|| format!("failed to clear staged {}", file.name))?;
    Ok(())
}
