//! Ordered delivery of complete splits to the messaging endpoint.
//!
//! Organisations are visited in the order of their earliest pending sequence
//! number. Within one organisation splits go out strictly in sequence order
//! and the first failure holds back the rest of that organisation's backlog.
//! Failures are recorded and retried on the next run; they never stop other
//! organisations.

use crate::alerts::{self, Alerter};
use crate::config::SourceConfig;
use crate::db::{self, PendingSplit, Pool};
use crate::messaging::{build_envelope, MessagingService};
use crate::model::NotificationRecord;
use crate::storage::ObjectStore;
use crate::vendor::PayloadBuilder;
use anyhow::Result;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const NOT_SENT: &str = "Not Sent To Messaging API";

pub struct NotifyContext<'a> {
    pub pool: &'a Pool,
    pub source: &'a SourceConfig,
    pub payload: &'a dyn PayloadBuilder,
    pub messaging: &'a dyn MessagingService,
    pub alerter: &'a dyn Alerter,
    pub store: &'a dyn ObjectStore,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NotifyReport {
    pub ok: usize,
    pub failed: usize,
    /// Splits acknowledged without being forwarded.
    pub acknowledged: usize,
    pub paused: bool,
}

/// Group pending splits by organisation, preserving sequence order inside each
/// group and ordering groups by their first split.
pub fn group_by_organisation(mut pending: Vec<PendingSplit>) -> Vec<(String, Vec<PendingSplit>)> {
    pending.sort_by_key(|p| (p.sequence_number, p.split.id));
    let mut groups: Vec<(String, Vec<PendingSplit>)> = Vec::new();
    for split in pending {
        match groups
            .iter_mut()
            .find(|(org, _)| *org == split.split.organisation_id)
        {
            Some((_, list)) => list.push(split),
            None => groups.push((split.split.organisation_id.clone(), vec![split])),
        }
    }
    groups
}

enum Outcome {
    Sent,
    Acknowledged,
    Failed,
}

#[instrument(skip_all, fields(source = %ctx.source.id))]
pub async fn notify_source(ctx: &NotifyContext<'_>) -> Result<NotifyReport> {
    let mut report = NotifyReport::default();
    if let Some(since) = db::is_notification_paused(ctx.pool, &ctx.source.id).await? {
        info!(%since, "notification paused; skipping");
        report.paused = true;
        return Ok(report);
    }

    let pending = db::get_unnotified_splits(ctx.pool, &ctx.source.id).await?;
    if pending.is_empty() {
        return Ok(report);
    }
    debug!(count = pending.len(), "pending splits");

    for (organisation, splits) in group_by_organisation(pending) {
        for (idx, split) in splits.iter().enumerate() {
            match notify_split(ctx, split, &splits[idx + 1..]).await? {
                Outcome::Sent => report.ok += 1,
                Outcome::Acknowledged => report.acknowledged += 1,
                Outcome::Failed => {
                    report.failed += 1;
                    let held = splits.len() - idx - 1;
                    if held > 0 {
                        warn!(organisation = %organisation, held, "holding back later splits");
                    }
                    break;
                }
            }
        }
    }

    info!(
        ok = report.ok,
        acknowledged = report.acknowledged,
        failed = report.failed,
        "notification pass finished"
    );
    Ok(report)
}

async fn notify_split(
    ctx: &NotifyContext<'_>,
    pending: &PendingSplit,
    later: &[PendingSplit],
) -> Result<Outcome> {
    let split = &pending.split;
    let message_id = Uuid::new_v4().to_string();
    let mut record = NotificationRecord {
        batch_id: split.batch_id,
        split_id: split.id,
        source_id: split.source_id.clone(),
        message_id: message_id.clone(),
        outbound: None,
        inbound: None,
        success: false,
        error_text: None,
    };

    let payload = match ctx.payload.build_payload(pending, later, ctx.store).await {
        Ok(payload) => payload,
        Err(err) => {
            let text = format!(
                "building payload for split {} of batch {}: {:#}",
                split.id, pending.batch_identifier, err
            );
            record.error_text = Some(text.clone());
            db::record_notification(ctx.pool, &record).await?;
            failed(ctx, pending, &text).await?;
            return Ok(Outcome::Failed);
        }
    };

    let Some(payload) = payload else {
        record.success = true;
        record.inbound = Some(NOT_SENT.to_string());
        db::record_notification(ctx.pool, &record).await?;
        succeeded(ctx, pending).await?;
        debug!(split_id = split.id, "acknowledged without sending");
        return Ok(Outcome::Acknowledged);
    };

    let envelope = build_envelope(&message_id, ctx.source, &split.organisation_id, &payload);
    record.outbound = Some(serde_json::to_string(&envelope)?);
    match ctx.messaging.send(&envelope, split.is_bulk).await {
        Ok(response) => {
            record.success = true;
            record.inbound = Some(format!("{}\n{}", response.status_line, response.body));
            db::record_notification(ctx.pool, &record).await?;
            succeeded(ctx, pending).await?;
            info!(
                split_id = split.id,
                organisation = %split.organisation_id,
                sequence = pending.sequence_number,
                "split notified"
            );
            Ok(Outcome::Sent)
        }
        Err(err) => {
            let text = err.to_string();
            record.inbound = err.inbound();
            record.error_text = Some(text.clone());
            db::record_notification(ctx.pool, &record).await?;
            failed(ctx, pending, &text).await?;
            Ok(Outcome::Failed)
        }
    }
}

async fn succeeded(ctx: &NotifyContext<'_>, pending: &PendingSplit) -> Result<()> {
    let split = &pending.split;
    db::mark_split_notified(ctx.pool, split.id).await?;
    if split.alert_signature.is_some() {
        alerts::raise(
            ctx.alerter,
            &format!(
                "Cleared: split {} ({}) of batch {} on {} has been notified",
                split.id, split.organisation_id, pending.batch_identifier, split.source_id
            ),
        )
        .await;
    }
    Ok(())
}

/// One delivered alert per distinct error text while the split stays
/// unnotified. The signature is only stored once the alert went out, so an
/// undeliverable alert is retried on the next failure.
async fn failed(ctx: &NotifyContext<'_>, pending: &PendingSplit, error_text: &str) -> Result<()> {
    let split = &pending.split;
    warn!(split_id = split.id, organisation = %split.organisation_id, error = %error_text, "notification failed");
    if split.alert_signature.as_deref() == Some(error_text) {
        return Ok(());
    }
    let delivered = alerts::raise(
        ctx.alerter,
        &format!(
            "Failed to notify split {} ({}) of batch {} on {}: {}",
            split.id, split.organisation_id, pending.batch_identifier, split.source_id, error_text
        ),
    )
    .await;
    if delivered {
        db::set_split_alert_signature(ctx.pool, split.id, Some(error_text)).await?;
    }
    Ok(())
}
