use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One delivery cycle for a source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    pub id: i64,
    pub source_id: String,
    pub batch_identifier: String,
    /// Relative path `<batch_identifier>/<id>` under the source's storage prefix.
    pub local_path: String,
    pub inserted_at: DateTime<Utc>,
    pub sequence_number: Option<i64>,
    pub complete_date: Option<DateTime<Utc>>,
    pub extract_date: Option<DateTime<Utc>>,
    pub extract_cutoff: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn is_complete(&self) -> bool {
        self.complete_date.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchFile {
    pub id: i64,
    pub batch_id: i64,
    pub filename: String,
    pub file_type: String,
    pub remote_size: i64,
    pub remote_modified: Option<DateTime<Utc>>,
    pub is_downloaded: bool,
    pub is_deleted: bool,
}

/// A batch's content scoped to one organisation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSplit {
    pub id: i64,
    pub batch_id: i64,
    pub source_id: String,
    pub organisation_id: String,
    pub storage_path: String,
    pub is_bulk: bool,
    pub have_notified: bool,
    pub notified_at: Option<DateTime<Utc>>,
    /// Last error alerted for this split while it stays unnotified.
    pub alert_signature: Option<String>,
}

impl BatchSplit {
    /// Organisation directory name, the last component of the storage path.
    pub fn directory_name(&self) -> &str {
        self.storage_path
            .rsplit('/')
            .next()
            .unwrap_or(self.storage_path.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSplit {
    pub batch_id: i64,
    pub source_id: String,
    pub organisation_id: String,
    pub storage_path: String,
    pub is_bulk: bool,
}

/// Append-only log entry for one notification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub batch_id: i64,
    pub split_id: i64,
    pub source_id: String,
    pub message_id: String,
    pub outbound: Option<String>,
    pub inbound: Option<String>,
    pub success: bool,
    pub error_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrganisationMapping {
    pub vendor: String,
    pub internal_id: String,
    pub code: String,
    pub name: Option<String>,
}

/// Outcome of recording a reference-data sighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingChange {
    Inserted,
    Updated,
    Unchanged,
    /// The stored code differs; the mapping is left untouched.
    CodeChanged { previous: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollingAttempt {
    pub id: i64,
    pub source_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_text: Option<String>,
    pub files_downloaded: i64,
    pub batches_completed: i64,
    pub splits_notified_ok: i64,
    pub splits_notified_failure: i64,
    pub alert_raised: bool,
}

/// A file as listed by the remote drop-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub path: String,
}

/// Vendor ordering key for sequencing batches.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrderKey {
    Timestamp(NaiveDateTime),
    Number(i64),
    Text(String),
}

/// Result of registering an inbound file against its batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub already_downloaded: bool,
    pub file_id: i64,
    pub batch_id: i64,
    pub batch_path: String,
}

