//! Strict delivery order for incomplete batches.
use crate::db::{self, Pool};
use crate::error::IngestError;
use crate::model::{Batch, OrderKey};
use crate::vendor::BatchOrdering;
use tracing::{info, instrument};

/// Number `batches` from `next` in ordering-key order, ties broken by id.
///
/// Fails when the ordering cannot place every batch.
pub fn assign_sequence(
    batches: &[Batch],
    next: i64,
    ordering: &dyn BatchOrdering,
) -> Result<Vec<(i64, i64)>, IngestError> {
    let mut keyed: Vec<(OrderKey, i64)> = Vec::with_capacity(batches.len());
    let mut unplaced = Vec::new();
    for batch in batches {
        match ordering.ordering_key(batch) {
            Some(key) => keyed.push((key, batch.id)),
            None => unplaced.push(batch.batch_identifier.clone()),
        }
    }
    if !unplaced.is_empty() {
        return Err(IngestError::fatal(format!(
            "ordering key could not place batches {:?}",
            unplaced
        )));
    }

    keyed.sort();
    Ok(keyed
        .into_iter()
        .enumerate()
        .map(|(i, (_, id))| (id, next + i as i64))
        .collect())
}

/// Sequence every incomplete batch of a source and return them in order.
///
/// Existing numbers are cleared and committed before the new ones are
/// written, so two batches never share a number even transiently.
#[instrument(skip_all, fields(source = %source_id))]
pub async fn sequence_batches(
    pool: &Pool,
    source_id: &str,
    ordering: &dyn BatchOrdering,
) -> Result<Vec<Batch>, IngestError> {
    let next = db::get_last_complete_batch(pool, source_id)
        .await?
        .and_then(|b| b.sequence_number)
        .map(|n| n + 1)
        .unwrap_or(1);
    let batches = db::get_incomplete_batches(pool, source_id).await?;
    if batches.is_empty() {
        return Ok(batches);
    }

    let assignments = assign_sequence(&batches, next, ordering)?;
    let unchanged = assignments.iter().all(|(id, n)| {
        batches
            .iter()
            .any(|b| b.id == *id && b.sequence_number == Some(*n))
    });
    if !unchanged {
        let ids: Vec<i64> = batches.iter().map(|b| b.id).collect();
        db::clear_sequence_numbers(pool, &ids).await?;
        db::set_sequence_numbers(pool, &assignments).await?;
        info!(count = assignments.len(), first = next, "sequenced batches");
    }

    let mut ordered = Vec::with_capacity(assignments.len());
    for (id, n) in &assignments {
        if let Some(batch) = batches.iter().find(|b| b.id == *id) {
            let mut batch = batch.clone();
            batch.sequence_number = Some(*n);
            ordered.push(batch);
        }
    }
    Ok(ordered)
}
