//! Bulk/delta classification of splits.
//!
//! The label is advisory: it shapes payloads and shows up in operational
//! tooling, but never decides whether a split is sent. A detector error is
//! therefore logged and the split treated as a delta.

use crate::unpack::UnpackedBatch;
use crate::vendor::BulkDetector;
use anyhow::Result;
use std::path::Path;
use tracing::{debug, warn};

pub fn classify_split(
    detector: &dyn BulkDetector,
    batch: &UnpackedBatch,
    split_dir: &Path,
    organisation: &str,
) -> bool {
    match detector.classify_bulk(batch, split_dir) {
        Ok(is_bulk) => {
            debug!(organisation, batch = %batch.batch.batch_identifier, is_bulk, "classified split");
            is_bulk
        }
        Err(err) => {
            warn!(?err, organisation, batch = %batch.batch.batch_identifier, "bulk detection failed; treating as delta");
            false
        }
    }
}

/// Row count of a CSV file, or `None` as soon as a row has `deleted_column`
/// set to `true`. A missing column counts as no deletes.
pub fn rows_without_deletes(path: &Path, deleted_column: &str) -> Result<Option<usize>> {
    let mut reader = crate::vendor::common::csv_reader(path)?;
    let deleted = crate::vendor::common::column_index(&mut reader, deleted_column)?;
    let mut rows = 0usize;
    for record in reader.records() {
        let record = record?;
        let is_deleted = deleted
            .and_then(|idx| record.get(idx))
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if is_deleted {
            return Ok(None);
        }
        rows += 1;
    }
    Ok(Some(rows))
}

/// Full-extract heuristic for feeds without an explicit marker.
pub fn looks_like_full_extract(path: &Path, deleted_column: &str, min_rows: usize) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    Ok(matches!(rows_without_deletes(path, deleted_column)?, Some(rows) if rows >= min_rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Batch;
    use anyhow::anyhow;
    use chrono::Utc;
    use std::fs;
    use tempfile::tempdir;

    struct Failing;

    impl BulkDetector for Failing {
        fn classify_bulk(&self, _batch: &UnpackedBatch, _split_dir: &Path) -> Result<bool> {
            Err(anyhow!("unreadable"))
        }
    }

    struct Always(bool);

    impl BulkDetector for Always {
        fn classify_bulk(&self, _batch: &UnpackedBatch, _split_dir: &Path) -> Result<bool> {
            Ok(self.0)
        }
    }

    fn batch(dir: &Path) -> UnpackedBatch {
        UnpackedBatch {
            batch: Batch {
                id: 1,
                source_id: "S1".into(),
                batch_identifier: "b".into(),
                local_path: "b/1".into(),
                inserted_at: Utc::now(),
                sequence_number: None,
                complete_date: None,
                extract_date: None,
                extract_cutoff: None,
            },
            dir: dir.to_path_buf(),
            files: Vec::new(),
        }
    }

    #[test]
    fn detector_errors_default_to_delta() {
        let td = tempdir().unwrap();
        let b = batch(td.path());
        assert!(!classify_split(&Failing, &b, td.path(), "ORG1"));
        assert!(classify_split(&Always(true), &b, td.path(), "ORG1"));
    }

    #[test]
    fn full_extract_heuristic() {
        let td = tempdir().unwrap();
        let path = td.path().join("p.csv");
        fs::write(&path, "Id,Deleted\n1,false\n2,FALSE\n3,false\n").unwrap();
        assert_eq!(rows_without_deletes(&path, "Deleted").unwrap(), Some(3));
        assert!(looks_like_full_extract(&path, "Deleted", 3).unwrap());
        assert!(!looks_like_full_extract(&path, "Deleted", 4).unwrap());

        fs::write(&path, "Id,Deleted\n1,false\n2,true\n").unwrap();
        assert_eq!(rows_without_deletes(&path, "Deleted").unwrap(), None);
        assert!(!looks_like_full_extract(&path, "Deleted", 0).unwrap());

        assert!(!looks_like_full_extract(&td.path().join("missing.csv"), "Deleted", 0).unwrap());
    }
}
