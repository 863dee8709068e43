//! One polling pass for one source.
//!
//! `lock -> intake -> reject unknown files -> sequence -> per batch {unpack,
//! validate, split, post-split validate, complete} -> notify -> housekeeping
//! -> release`. A validation stop breaks out of the batch loop but still lets
//! notification and housekeeping run. Every pass is saved as a polling
//! attempt and compared with the previous one to decide on alerts.

use crate::alerts::{self, Alerter};
use crate::config::{Config, SourceConfig};
use crate::db::{self, Pool};
use crate::error::IngestError;
use crate::intake::{self, IntakeContext};
use crate::messaging::{HttpMessagingClient, MessagingService};
use crate::model::{Batch, MappingChange, PollingAttempt};
use crate::notifier::{self, NotifyContext};
use crate::remote::RemoteSource;
use crate::sequencer;
use crate::split::{self, SplitContext};
use crate::storage::{LocalStore, ObjectStore, Staging};
use crate::unpack::{self, UnpackedBatch};
use crate::vendor::{self, HousekeepingContext, VendorStrategy};
use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertAction {
    Raise,
    Clear,
    None,
}

/// Compare this pass's error with the previous attempt.
///
/// Returns the action and whether an alert is standing after it. An error
/// matching a transient pattern is held back for its first occurrence.
pub fn decide_alert(
    previous: Option<&PollingAttempt>,
    current_error: Option<&str>,
    transient: &[Regex],
) -> (AlertAction, bool) {
    let previous_error = previous.and_then(|p| p.error_text.as_deref());
    let previously_raised = previous.map(|p| p.alert_raised).unwrap_or(false);

    let Some(error) = current_error else {
        return if previously_raised {
            (AlertAction::Clear, false)
        } else {
            (AlertAction::None, false)
        };
    };

    if previous_error == Some(error) && previously_raised {
        return (AlertAction::None, true);
    }
    let is_transient = transient.iter().any(|re| re.is_match(error));
    if is_transient && previous_error != Some(error) {
        return (AlertAction::None, false);
    }
    (AlertAction::Raise, true)
}

enum BatchOutcome {
    Completed(Batch),
    Deferred,
}

pub struct Runner {
    pub pool: Pool,
    pub store: Arc<dyn ObjectStore>,
    pub staging: Staging,
    pub messaging: Arc<dyn MessagingService>,
    pub alerter: Arc<dyn Alerter>,
    pub lock_wait: Duration,
    pub lock_lease: Duration,
}

impl Runner {
    pub async fn from_config(cfg: &Config) -> Result<Self> {
        cfg.ensure_dirs()?;
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}", cfg.app.database_path().display()));
        let pool = db::init_pool(&database_url).await?;
        db::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            store: Arc::new(LocalStore::new(&cfg.app.storage_dir)),
            staging: Staging::new(&cfg.app.staging_dir),
            messaging: Arc::new(HttpMessagingClient::from_config(&cfg.messaging)?),
            alerter: alerts::from_config(&cfg.alerts)?,
            lock_wait: Duration::from_secs(cfg.app.lock_wait_seconds),
            lock_lease: Duration::from_secs(cfg.app.lock_lease_seconds),
        })
    }

    /// Run one pass and persist its outcome. Only bookkeeping failures are
    /// returned as errors; pass failures end up in the attempt.
    #[instrument(skip_all, fields(source = %source.id))]
    pub async fn run_source(
        &self,
        source: &SourceConfig,
        remote: &dyn RemoteSource,
    ) -> Result<PollingAttempt> {
        let strategy = vendor::strategy_for(source);
        let mut attempt = PollingAttempt {
            source_id: source.id.clone(),
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let lock_name = format!("feed-reader-{}", source.id);
        let outcome =
            match db::acquire_source_lock(&self.pool, &lock_name, self.lock_wait, self.lock_lease)
                .await
            {
                Ok(lock) => {
                    debug!(lock = %lock.name(), "lock held");
                    let outcome = self.run_stages(source, &strategy, remote, &mut attempt).await;
                    if let Err(err) = lock.release().await {
                        warn!(?err, lock = %lock_name, "failed to release source lock");
                    }
                    outcome
                }
                Err(err) => Err(err),
            };

        if let Err(err) = &outcome {
            if err.is_validation() {
                warn!(error = %err.describe(), "pass stopped at validation");
            } else {
                error!(error = %err.describe(), "pass aborted");
            }
            attempt.error_text = Some(err.describe());
        }
        attempt.finished_at = Some(Utc::now());

        let transient: Vec<Regex> = source
            .transient_error_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        let previous = db::get_last_polling_attempt(&self.pool, &source.id).await?;
        let (action, raised) =
            decide_alert(previous.as_ref(), attempt.error_text.as_deref(), &transient);
        attempt.alert_raised = raised;
        match (action, attempt.error_text.as_deref()) {
            (AlertAction::Raise, Some(error)) => {
                // undelivered: leave it unraised so the next pass tries again
                attempt.alert_raised =
                    alerts::raise(self.alerter.as_ref(), &format!("{}: {}", source.id, error))
                        .await;
            }
            (AlertAction::Clear, _) => {
                alerts::raise(
                    self.alerter.as_ref(),
                    &format!("Cleared: {} is polling without errors", source.id),
                )
                .await;
            }
            _ => {}
        }

        attempt.id = db::save_polling_attempt(&self.pool, &attempt)
            .await
            .context("failed to save polling attempt")?;
        info!(
            downloaded = attempt.files_downloaded,
            completed = attempt.batches_completed,
            notified = attempt.splits_notified_ok,
            failed = attempt.splits_notified_failure,
            "pass finished"
        );
        Ok(attempt)
    }

    async fn run_stages(
        &self,
        source: &SourceConfig,
        strategy: &VendorStrategy,
        remote: &dyn RemoteSource,
        attempt: &mut PollingAttempt,
    ) -> Result<(), IngestError> {
        let report = intake::run_intake(&IntakeContext {
            pool: &self.pool,
            source_id: &source.id,
            remote,
            parser: strategy.parser.as_ref(),
            staging: &self.staging,
            store: self.store.as_ref(),
        })
        .await?;
        attempt.files_downloaded = report.downloaded as i64;
        for name in &report.newly_unknown {
            warn!(filename = %name, "new unknown file recorded");
        }

        let unknown = db::list_unknown_files(&self.pool, &source.id).await?;
        if !unknown.is_empty() {
            return Err(IngestError::fatal(format!(
                "unknown files present for {}: {}",
                source.id,
                unknown.join(", ")
            )));
        }

        let batches =
            sequencer::sequence_batches(&self.pool, &source.id, strategy.ordering.as_ref()).await?;
        let mut last_complete = db::get_last_complete_batch(&self.pool, &source.id).await?;
        let mut stopped: Option<IngestError> = None;
        for (idx, batch) in batches.iter().enumerate() {
            stopped = match self
                .process_batch(source, strategy, batch, last_complete.as_ref())
                .await
            {
                Ok(BatchOutcome::Completed(done)) => {
                    attempt.batches_completed += 1;
                    last_complete = Some(done);
                    continue;
                }
                Ok(BatchOutcome::Deferred) => None,
                Err(err) if err.is_validation() => Some(err),
                Err(err) => return Err(err),
            };
            let held: Vec<i64> = batches[idx..].iter().map(|b| b.id).collect();
            db::clear_sequence_numbers(&self.pool, &held).await?;
            info!(
                batch = %batch.batch_identifier,
                held = held.len(),
                "batch loop stopped; later batches left incomplete"
            );
            break;
        }

        let report = notifier::notify_source(&NotifyContext {
            pool: &self.pool,
            source,
            payload: strategy.payload.as_ref(),
            messaging: self.messaging.as_ref(),
            alerter: self.alerter.as_ref(),
            store: self.store.as_ref(),
        })
        .await?;
        attempt.splits_notified_ok = (report.ok + report.acknowledged) as i64;
        attempt.splits_notified_failure = report.failed as i64;

        let housekeeping = strategy
            .housekeeper
            .run_housekeeping(&HousekeepingContext {
                pool: &self.pool,
                source,
                store: self.store.as_ref(),
                staging: &self.staging,
            })
            .await
            .with_context(|| format!("housekeeping for {}", source.id))?;
        if housekeeping.files_deleted > 0 || housekeeping.staging_cleared > 0 {
            info!(
                files_deleted = housekeeping.files_deleted,
                staging_cleared = housekeeping.staging_cleared,
                "housekeeping"
            );
        }

        match stopped {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[instrument(skip_all, fields(batch_id = batch.id, batch = %batch.batch_identifier))]
    async fn process_batch(
        &self,
        source: &SourceConfig,
        strategy: &VendorStrategy,
        batch: &Batch,
        last_complete: Option<&Batch>,
    ) -> Result<BatchOutcome, IngestError> {
        let unpacked =
            unpack::unpack_batch(&self.pool, self.store.as_ref(), &self.staging, batch).await?;
        match strategy.validator.validate_batch(&unpacked, last_complete) {
            Ok(true) => {}
            Ok(false) => {
                info!("batch not ready; deferring");
                return Ok(BatchOutcome::Deferred);
            }
            Err(err) => {
                return Err(IngestError::validation(
                    &batch.batch_identifier,
                    format!("{:#}", err),
                ))
            }
        }

        self.harvest_organisations(source, strategy, &unpacked).await?;

        let ctx = SplitContext {
            pool: &self.pool,
            store: self.store.as_ref(),
            staging: &self.staging,
            source,
            strategy,
        };
        let splits = split::split_batch(&ctx, &unpacked, last_complete).await?;

        let extract_date = strategy
            .dates
            .detect_extract_date(&unpacked)
            .with_context(|| format!("extract date of batch {}", batch.batch_identifier))?;
        let extract_cutoff = strategy
            .dates
            .detect_extract_cutoff(&unpacked)
            .with_context(|| format!("extract cutoff of batch {}", batch.batch_identifier))?;
        let mut dated = batch.clone();
        dated.extract_date = extract_date;
        dated.extract_cutoff = extract_cutoff;
        if let Err(err) = strategy.validator.validate_post_split(&dated, last_complete) {
            split::discard_splits(&self.pool, self.store.as_ref(), batch).await?;
            return Err(err);
        }

        db::mark_batch_complete(&self.pool, batch.id, extract_date, extract_cutoff).await?;
        info!(splits = splits.len(), sequence = ?batch.sequence_number, "batch complete");
        Ok(BatchOutcome::Completed(db::get_batch(&self.pool, batch.id).await?))
    }

    async fn harvest_organisations(
        &self,
        source: &SourceConfig,
        strategy: &VendorStrategy,
        unpacked: &UnpackedBatch,
    ) -> Result<(), IngestError> {
        let mappings = strategy
            .reference
            .harvest_organisations(unpacked)
            .with_context(|| {
                format!("reading organisations from batch {}", unpacked.batch.batch_identifier)
            })?;
        for mapping in mappings {
            match db::upsert_organisation_mapping(&self.pool, &mapping).await? {
                MappingChange::CodeChanged { previous } => {
                    let name = strategy
                        .resolve_organisation_name(&self.pool, &mapping.internal_id)
                        .await?
                        .unwrap_or_default();
                    return Err(IngestError::fatal(format!(
                        "organisation {} ({}) changed code from {} to {} in batch {} of {}",
                        mapping.internal_id,
                        name,
                        previous,
                        mapping.code,
                        unpacked.batch.batch_identifier,
                        source.id
                    )));
                }
                MappingChange::Inserted => {
                    info!(internal_id = %mapping.internal_id, code = %mapping.code, "new organisation");
                }
                MappingChange::Updated | MappingChange::Unchanged => {}
            }
        }
        Ok(())
    }
}
