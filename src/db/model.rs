//! View models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::BatchSplit;

/// Unnotified split of a complete batch, carrying the batch ordering fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSplit {
    pub split: BatchSplit,
    pub sequence_number: i64,
    pub batch_identifier: String,
}

/// Downloaded raw file past its retention period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredFile {
    pub file_id: i64,
    pub filename: String,
    pub batch_path: String,
}
