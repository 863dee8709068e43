use super::model::{ExpiredFile, PendingSplit};
use crate::model::{
    Batch, BatchFile, BatchSplit, MappingChange, NewSplit, NotificationRecord,
    OrganisationMapping, PollingAttempt, Registration,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

const BATCH_COLUMNS: &str = "id, source_id, batch_identifier, local_path, inserted_at, \
     sequence_number, complete_date, extract_date, extract_cutoff";

const SPLIT_COLUMNS: &str = "s.id, s.batch_id, s.source_id, s.organisation_id, s.storage_path, \
     s.is_bulk, s.have_notified, s.notified_at, s.alert_signature";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    rebuilt.push('?');
    rebuilt.push_str(query_part.unwrap_or("mode=rwc"));
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn batch_from_row(row: &SqliteRow) -> Result<Batch> {
    Ok(Batch {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        batch_identifier: row.try_get("batch_identifier")?,
        local_path: row.try_get("local_path")?,
        inserted_at: row.try_get("inserted_at")?,
        sequence_number: row.try_get("sequence_number")?,
        complete_date: row.try_get("complete_date")?,
        extract_date: row.try_get("extract_date")?,
        extract_cutoff: row.try_get("extract_cutoff")?,
    })
}

fn split_from_row(row: &SqliteRow) -> Result<BatchSplit> {
    Ok(BatchSplit {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        source_id: row.try_get("source_id")?,
        organisation_id: row.try_get("organisation_id")?,
        storage_path: row.try_get("storage_path")?,
        is_bulk: row.try_get("is_bulk")?,
        have_notified: row.try_get("have_notified")?,
        notified_at: row.try_get("notified_at")?,
        alert_signature: row.try_get("alert_signature")?,
    })
}

// --- intake ---------------------------------------------------------------

/// Find or create the incomplete batch for `batch_identifier` and the file row
/// for `filename`, in one transaction.
///
/// A filename already known anywhere in the source is returned as-is, so a
/// file re-listed after its batch completed is never transferred twice.
#[instrument(skip_all, fields(source = %source_id, filename = %filename))]
pub async fn register_file(
    pool: &Pool,
    source_id: &str,
    batch_identifier: &str,
    file_type: &str,
    filename: &str,
    remote_size: i64,
    remote_modified: Option<DateTime<Utc>>,
) -> Result<Registration> {
    let mut tx = pool.begin().await?;

    let existing = sqlx::query(
        "SELECT f.id, f.is_downloaded, b.id AS batch_id, b.local_path \
         FROM batch_file f JOIN batch b ON b.id = f.batch_id \
         WHERE f.source_id = ? AND f.filename = ?",
    )
    .bind(source_id)
    .bind(filename)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some(row) = existing {
        tx.commit().await?;
        return Ok(Registration {
            already_downloaded: row.try_get("is_downloaded")?,
            file_id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            batch_path: row.try_get("local_path")?,
        });
    }

    let batch = sqlx::query(
        "SELECT id, local_path FROM batch \
         WHERE source_id = ? AND batch_identifier = ? AND complete_date IS NULL",
    )
    .bind(source_id)
    .bind(batch_identifier)
    .fetch_optional(&mut *tx)
    .await?;

    let (batch_id, batch_path) = match batch {
        Some(row) => (row.try_get::<i64, _>("id")?, row.try_get::<String, _>("local_path")?),
        None => {
            let batch_id: i64 = sqlx::query(
                "INSERT INTO batch (source_id, batch_identifier, inserted_at) VALUES (?, ?, ?) RETURNING id",
            )
            .bind(source_id)
            .bind(batch_identifier)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await?
            .try_get("id")?;
            let path = format!("{}/{}", batch_identifier, batch_id);
            sqlx::query("UPDATE batch SET local_path = ? WHERE id = ?")
                .bind(&path)
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
            debug!(batch_id, batch_identifier, "created batch");
            (batch_id, path)
        }
    };

    let file_id: i64 = sqlx::query(
        "INSERT INTO batch_file (batch_id, source_id, filename, file_type, remote_size, remote_modified) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(batch_id)
    .bind(source_id)
    .bind(filename)
    .bind(file_type)
    .bind(remote_size)
    .bind(remote_modified)
    .fetch_one(&mut *tx)
    .await?
    .try_get("id")?;

    tx.commit().await?;
    Ok(Registration {
        already_downloaded: false,
        file_id,
        batch_id,
        batch_path,
    })
}

#[instrument(skip_all)]
pub async fn mark_downloaded(pool: &Pool, file_id: i64) -> Result<()> {
    sqlx::query("UPDATE batch_file SET is_downloaded = 1, downloaded_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(file_id)
        .execute(pool)
        .await
        .context("failed to mark file downloaded")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_deleted(pool: &Pool, file_id: i64) -> Result<()> {
    sqlx::query("UPDATE batch_file SET is_deleted = 1 WHERE id = ?")
        .bind(file_id)
        .execute(pool)
        .await
        .context("failed to mark file deleted")?;
    Ok(())
}

/// Returns true only the first time a filename is recorded for a source.
#[instrument(skip_all, fields(source = %source_id, filename = %filename))]
pub async fn record_unknown_file(
    pool: &Pool,
    source_id: &str,
    filename: &str,
    remote_size: i64,
    remote_modified: Option<DateTime<Utc>>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO unknown_file (source_id, filename, remote_size, remote_modified, inserted_at) \
         VALUES (?, ?, ?, ?, ?) ON CONFLICT (source_id, filename) DO NOTHING",
    )
    .bind(source_id)
    .bind(filename)
    .bind(remote_size)
    .bind(remote_modified)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn list_unknown_files(pool: &Pool, source_id: &str) -> Result<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT filename FROM unknown_file WHERE source_id = ? ORDER BY filename",
    )
    .bind(source_id)
    .fetch_all(pool)
    .await?;
    Ok(names)
}

/// Forget unknown files once an operator has dealt with them.
pub async fn clear_unknown_files(pool: &Pool, source_id: &str) -> Result<u64> {
    let res = sqlx::query("DELETE FROM unknown_file WHERE source_id = ?")
        .bind(source_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn get_batch_files(pool: &Pool, batch_id: i64) -> Result<Vec<BatchFile>> {
    let rows = sqlx::query(
        "SELECT id, batch_id, filename, file_type, remote_size, remote_modified, is_downloaded, is_deleted \
         FROM batch_file WHERE batch_id = ? ORDER BY filename",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(BatchFile {
                id: row.try_get("id")?,
                batch_id: row.try_get("batch_id")?,
                filename: row.try_get("filename")?,
                file_type: row.try_get("file_type")?,
                remote_size: row.try_get("remote_size")?,
                remote_modified: row.try_get("remote_modified")?,
                is_downloaded: row.try_get("is_downloaded")?,
                is_deleted: row.try_get("is_deleted")?,
            })
        })
        .collect()
}

// --- batches --------------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_batch(pool: &Pool, batch_id: i64) -> Result<Batch> {
    let row = sqlx::query(&format!("SELECT {} FROM batch WHERE id = ?", BATCH_COLUMNS))
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(anyhow!("batch {} not found", batch_id));
    };
    batch_from_row(&row)
}

#[instrument(skip_all)]
pub async fn get_incomplete_batches(pool: &Pool, source_id: &str) -> Result<Vec<Batch>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM batch WHERE source_id = ? AND complete_date IS NULL ORDER BY id",
        BATCH_COLUMNS
    ))
    .bind(source_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(batch_from_row).collect()
}

/// The complete batch with the highest sequence number.
#[instrument(skip_all)]
pub async fn get_last_complete_batch(pool: &Pool, source_id: &str) -> Result<Option<Batch>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM batch WHERE source_id = ? AND complete_date IS NOT NULL \
         ORDER BY sequence_number DESC LIMIT 1",
        BATCH_COLUMNS
    ))
    .bind(source_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(batch_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_all_batches(pool: &Pool, source_id: &str) -> Result<Vec<Batch>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM batch WHERE source_id = ? ORDER BY id",
        BATCH_COLUMNS
    ))
    .bind(source_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(batch_from_row).collect()
}

#[instrument(skip_all)]
pub async fn clear_sequence_number(pool: &Pool, batch_id: i64) -> Result<()> {
    sqlx::query("UPDATE batch SET sequence_number = NULL WHERE id = ?")
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_sequence_number(pool: &Pool, batch_id: i64, sequence_number: i64) -> Result<()> {
    sqlx::query("UPDATE batch SET sequence_number = ? WHERE id = ?")
        .bind(sequence_number)
        .bind(batch_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to set sequence {} on batch {}", sequence_number, batch_id))?;
    Ok(())
}

/// Clear the sequence numbers of several batches in one transaction.
#[instrument(skip_all)]
pub async fn clear_sequence_numbers(pool: &Pool, batch_ids: &[i64]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for id in batch_ids {
        sqlx::query("UPDATE batch SET sequence_number = NULL WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Persist `(batch_id, sequence_number)` pairs in one transaction.
#[instrument(skip_all)]
pub async fn set_sequence_numbers(pool: &Pool, assignments: &[(i64, i64)]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (batch_id, sequence_number) in assignments {
        sqlx::query("UPDATE batch SET sequence_number = ? WHERE id = ?")
            .bind(sequence_number)
            .bind(batch_id)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!("failed to set sequence {} on batch {}", sequence_number, batch_id)
            })?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_batch_complete(
    pool: &Pool,
    batch_id: i64,
    extract_date: Option<DateTime<Utc>>,
    extract_cutoff: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "UPDATE batch SET complete_date = ?, extract_date = ?, extract_cutoff = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(extract_date)
    .bind(extract_cutoff)
    .bind(batch_id)
    .execute(pool)
    .await
    .context("failed to mark batch complete")?;
    Ok(())
}

// --- splits ---------------------------------------------------------------

#[instrument(skip_all)]
pub async fn delete_splits(pool: &Pool, batch_id: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM batch_split WHERE batch_id = ?")
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn add_split(pool: &Pool, split: &NewSplit) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO batch_split (batch_id, source_id, organisation_id, storage_path, is_bulk) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(split.batch_id)
    .bind(&split.source_id)
    .bind(&split.organisation_id)
    .bind(&split.storage_path)
    .bind(split.is_bulk)
    .fetch_one(pool)
    .await?;
    Ok(rec.try_get("id")?)
}

#[instrument(skip_all)]
pub async fn get_splits_for_batch(pool: &Pool, batch_id: i64) -> Result<Vec<BatchSplit>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM batch_split s WHERE s.batch_id = ? ORDER BY s.id",
        SPLIT_COLUMNS
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(split_from_row).collect()
}

/// Unnotified splits of complete batches, in batch sequence order.
#[instrument(skip_all)]
pub async fn get_unnotified_splits(pool: &Pool, source_id: &str) -> Result<Vec<PendingSplit>> {
    let rows = sqlx::query(&format!(
        "SELECT {}, b.sequence_number, b.batch_identifier \
         FROM batch_split s JOIN batch b ON b.id = s.batch_id \
         WHERE s.source_id = ? AND s.have_notified = 0 \
           AND b.complete_date IS NOT NULL AND b.sequence_number IS NOT NULL \
         ORDER BY b.sequence_number, s.id",
        SPLIT_COLUMNS
    ))
    .bind(source_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(PendingSplit {
                split: split_from_row(row)?,
                sequence_number: row.try_get("sequence_number")?,
                batch_identifier: row.try_get("batch_identifier")?,
            })
        })
        .collect()
}

/// Mark a split delivered and drop its alert state.
#[instrument(skip_all)]
pub async fn mark_split_notified(pool: &Pool, split_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE batch_split SET have_notified = 1, notified_at = ?, alert_signature = NULL WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(split_id)
    .execute(pool)
    .await
    .context("failed to mark split notified")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_split_alert_signature(
    pool: &Pool,
    split_id: i64,
    signature: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE batch_split SET alert_signature = ? WHERE id = ?")
        .bind(signature)
        .bind(split_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_notification(pool: &Pool, record: &NotificationRecord) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO notification_message \
         (batch_id, batch_split_id, source_id, message_id, outbound, inbound, was_success, error_text, sent_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(record.batch_id)
    .bind(record.split_id)
    .bind(&record.source_id)
    .bind(&record.message_id)
    .bind(&record.outbound)
    .bind(&record.inbound)
    .bind(record.success)
    .bind(&record.error_text)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.try_get("id")?)
}

pub async fn get_notifications_for_split(
    pool: &Pool,
    split_id: i64,
) -> Result<Vec<NotificationRecord>> {
    let rows = sqlx::query(
        "SELECT batch_id, batch_split_id, source_id, message_id, outbound, inbound, was_success, error_text \
         FROM notification_message WHERE batch_split_id = ? ORDER BY id",
    )
    .bind(split_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(NotificationRecord {
                batch_id: row.try_get("batch_id")?,
                split_id: row.try_get("batch_split_id")?,
                source_id: row.try_get("source_id")?,
                message_id: row.try_get("message_id")?,
                outbound: row.try_get("outbound")?,
                inbound: row.try_get("inbound")?,
                success: row.try_get("was_success")?,
                error_text: row.try_get("error_text")?,
            })
        })
        .collect()
}

// --- organisations --------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_organisation_mapping(
    pool: &Pool,
    vendor: &str,
    internal_id: &str,
) -> Result<Option<OrganisationMapping>> {
    let row = sqlx::query(
        "SELECT vendor, internal_id, code, name FROM organisation_map WHERE vendor = ? AND internal_id = ?",
    )
    .bind(vendor)
    .bind(internal_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(OrganisationMapping {
        vendor: row.try_get("vendor")?,
        internal_id: row.try_get("internal_id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
    }))
}

/// Record a reference-data sighting. A new name refines the stored row; a
/// changed code is reported and not applied.
#[instrument(skip_all, fields(vendor = %mapping.vendor, internal_id = %mapping.internal_id))]
pub async fn upsert_organisation_mapping(
    pool: &Pool,
    mapping: &OrganisationMapping,
) -> Result<MappingChange> {
    let mut tx = pool.begin().await?;
    let existing = sqlx::query(
        "SELECT code, name FROM organisation_map WHERE vendor = ? AND internal_id = ?",
    )
    .bind(&mapping.vendor)
    .bind(&mapping.internal_id)
    .fetch_optional(&mut *tx)
    .await?;

    let change = match existing {
        None => {
            sqlx::query(
                "INSERT INTO organisation_map (vendor, internal_id, code, name, updated_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&mapping.vendor)
            .bind(&mapping.internal_id)
            .bind(&mapping.code)
            .bind(&mapping.name)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            MappingChange::Inserted
        }
        Some(row) => {
            let code: String = row.try_get("code")?;
            let name: Option<String> = row.try_get("name")?;
            if code != mapping.code {
                MappingChange::CodeChanged { previous: code }
            } else if mapping.name.is_some() && mapping.name != name {
                sqlx::query(
                    "UPDATE organisation_map SET name = ?, updated_at = ? WHERE vendor = ? AND internal_id = ?",
                )
                .bind(&mapping.name)
                .bind(Utc::now())
                .bind(&mapping.vendor)
                .bind(&mapping.internal_id)
                .execute(&mut *tx)
                .await?;
                MappingChange::Updated
            } else {
                MappingChange::Unchanged
            }
        }
    };
    tx.commit().await?;
    Ok(change)
}

// --- polling attempts -----------------------------------------------------

#[instrument(skip_all)]
pub async fn get_last_polling_attempt(
    pool: &Pool,
    source_id: &str,
) -> Result<Option<PollingAttempt>> {
    let row = sqlx::query(
        "SELECT id, source_id, started_at, finished_at, error_text, files_downloaded, batches_completed, \
                splits_notified_ok, splits_notified_failure, alert_raised \
         FROM polling_attempt WHERE source_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(source_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(PollingAttempt {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error_text: row.try_get("error_text")?,
        files_downloaded: row.try_get("files_downloaded")?,
        batches_completed: row.try_get("batches_completed")?,
        splits_notified_ok: row.try_get("splits_notified_ok")?,
        splits_notified_failure: row.try_get("splits_notified_failure")?,
        alert_raised: row.try_get("alert_raised")?,
    }))
}

#[instrument(skip_all)]
pub async fn save_polling_attempt(pool: &Pool, attempt: &PollingAttempt) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO polling_attempt \
         (source_id, started_at, finished_at, error_text, files_downloaded, batches_completed, \
          splits_notified_ok, splits_notified_failure, alert_raised) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&attempt.source_id)
    .bind(attempt.started_at.unwrap_or(now))
    .bind(attempt.finished_at.unwrap_or(now))
    .bind(&attempt.error_text)
    .bind(attempt.files_downloaded)
    .bind(attempt.batches_completed)
    .bind(attempt.splits_notified_ok)
    .bind(attempt.splits_notified_failure)
    .bind(attempt.alert_raised)
    .fetch_one(pool)
    .await?;
    Ok(rec.try_get("id")?)
}

// --- notification pause ---------------------------------------------------

#[instrument(skip_all)]
pub async fn is_notification_paused(
    pool: &Pool,
    source_id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let paused = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT paused_at FROM source_pause WHERE source_id = ?",
    )
    .bind(source_id)
    .fetch_optional(pool)
    .await?;
    Ok(paused)
}

pub async fn pause_notifications(pool: &Pool, source_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO source_pause (source_id, paused_at) VALUES (?, ?) ON CONFLICT (source_id) DO NOTHING",
    )
    .bind(source_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn resume_notifications(pool: &Pool, source_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM source_pause WHERE source_id = ?")
        .bind(source_id)
        .execute(pool)
        .await?;
    Ok(())
}

// --- housekeeping ---------------------------------------------------------

/// Downloaded, undeleted files of batches completed before `completed_before`.
#[instrument(skip_all)]
pub async fn get_expired_files(
    pool: &Pool,
    source_id: &str,
    completed_before: DateTime<Utc>,
) -> Result<Vec<ExpiredFile>> {
    let rows = sqlx::query(
        "SELECT f.id, f.filename, b.local_path, b.complete_date \
         FROM batch_file f JOIN batch b ON b.id = f.batch_id \
         WHERE f.source_id = ? AND f.is_downloaded = 1 AND f.is_deleted = 0 \
           AND b.complete_date IS NOT NULL \
         ORDER BY f.id",
    )
    .bind(source_id)
    .fetch_all(pool)
    .await?;
    let mut expired = Vec::new();
    for row in &rows {
        let complete_date: DateTime<Utc> = row.try_get("complete_date")?;
        if complete_date < completed_before {
            expired.push(ExpiredFile {
                file_id: row.try_get("id")?,
                filename: row.try_get("filename")?,
                batch_path: row.try_get("local_path")?,
            });
        }
    }
    Ok(expired)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    pub(crate) async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn register_file_is_idempotent() {
        let pool = setup_pool().await;
        let first = register_file(&pool, "S1", "2024-01-01", "Patient", "a.csv", 10, None)
            .await
            .unwrap();
        assert!(!first.already_downloaded);
        assert_eq!(first.batch_path, format!("2024-01-01/{}", first.batch_id));

        let again = register_file(&pool, "S1", "2024-01-01", "Patient", "a.csv", 10, None)
            .await
            .unwrap();
        assert_eq!(again.file_id, first.file_id);
        assert!(!again.already_downloaded);

        mark_downloaded(&pool, first.file_id).await.unwrap();
        let after = register_file(&pool, "S1", "2024-01-01", "Patient", "a.csv", 10, None)
            .await
            .unwrap();
        assert!(after.already_downloaded);

        let second_file = register_file(&pool, "S1", "2024-01-01", "Event", "b.csv", 5, None)
            .await
            .unwrap();
        assert_eq!(second_file.batch_id, first.batch_id);

        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batch_file")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(cnt, 2);
        assert_eq!(get_incomplete_batches(&pool, "S1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_identifier_gets_new_batch() {
        let pool = setup_pool().await;
        let first = register_file(&pool, "S1", "2024-01-01", "Patient", "a.csv", 10, None)
            .await
            .unwrap();
        set_sequence_number(&pool, first.batch_id, 1).await.unwrap();
        mark_batch_complete(&pool, first.batch_id, None, None)
            .await
            .unwrap();

        let late = register_file(&pool, "S1", "2024-01-01", "Patient", "late.csv", 10, None)
            .await
            .unwrap();
        assert_ne!(late.batch_id, first.batch_id);
        assert_ne!(late.batch_path, first.batch_path);

        let last = get_last_complete_batch(&pool, "S1").await.unwrap().unwrap();
        assert_eq!(last.id, first.batch_id);
        assert!(last.is_complete());
    }

    #[tokio::test]
    async fn unknown_file_recorded_once() {
        let pool = setup_pool().await;
        assert!(record_unknown_file(&pool, "S1", "junk.txt", 1, None).await.unwrap());
        assert!(!record_unknown_file(&pool, "S1", "junk.txt", 1, None).await.unwrap());
        assert!(record_unknown_file(&pool, "S2", "junk.txt", 1, None).await.unwrap());
        assert_eq!(list_unknown_files(&pool, "S1").await.unwrap(), vec!["junk.txt"]);
        assert_eq!(clear_unknown_files(&pool, "S1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn organisation_mapping_changes() {
        let pool = setup_pool().await;
        let mut mapping = OrganisationMapping {
            vendor: "emis".into(),
            internal_id: "guid-1".into(),
            code: "A12345".into(),
            name: None,
        };
        assert_eq!(
            upsert_organisation_mapping(&pool, &mapping).await.unwrap(),
            MappingChange::Inserted
        );
        assert_eq!(
            upsert_organisation_mapping(&pool, &mapping).await.unwrap(),
            MappingChange::Unchanged
        );
        mapping.name = Some("Practice One".into());
        assert_eq!(
            upsert_organisation_mapping(&pool, &mapping).await.unwrap(),
            MappingChange::Updated
        );
        mapping.code = "B99999".into();
        assert_eq!(
            upsert_organisation_mapping(&pool, &mapping).await.unwrap(),
            MappingChange::CodeChanged {
                previous: "A12345".into()
            }
        );
        let stored = get_organisation_mapping(&pool, "emis", "guid-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.code, "A12345");
        assert_eq!(stored.name.as_deref(), Some("Practice One"));
    }

    #[tokio::test]
    async fn polling_attempt_roundtrip_and_pause() {
        let pool = setup_pool().await;
        assert!(get_last_polling_attempt(&pool, "S1").await.unwrap().is_none());
        let attempt = PollingAttempt {
            source_id: "S1".into(),
            error_text: Some("boom".into()),
            files_downloaded: 3,
            alert_raised: true,
            ..Default::default()
        };
        save_polling_attempt(&pool, &attempt).await.unwrap();
        let last = get_last_polling_attempt(&pool, "S1").await.unwrap().unwrap();
        assert_eq!(last.error_text.as_deref(), Some("boom"));
        assert_eq!(last.files_downloaded, 3);
        assert!(last.alert_raised);

        assert!(is_notification_paused(&pool, "S1").await.unwrap().is_none());
        pause_notifications(&pool, "S1").await.unwrap();
        assert!(is_notification_paused(&pool, "S1").await.unwrap().is_some());
        resume_notifications(&pool, "S1").await.unwrap();
        assert!(is_notification_paused(&pool, "S1").await.unwrap().is_none());
    }

    #[test]
    fn sqlite_url_normalisation() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("db.sqlite");
        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(td.path().join("nested").exists());
    }
}
