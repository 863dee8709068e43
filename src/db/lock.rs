//! Exclusive per-source lock.
//!
//! SQLite has no session-bound advisory lock, so a held lock is a row in
//! `source_lock` carrying a random holder token. A row older than the lease is
//! treated as abandoned by a crashed process and may be reclaimed. While held,
//! a background task keeps renewing the lease so a long pass never looks
//! abandoned.

use super::repo::Pool;
use crate::error::IngestError;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct SourceLock {
    pool: Pool,
    name: String,
    holder: String,
    renewal: JoinHandle<()>,
}

impl SourceLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delete the lock row if this holder still owns it.
    pub async fn release(self) -> Result<()> {
        self.renewal.abort();
        let res = sqlx::query("DELETE FROM source_lock WHERE name = ? AND holder = ?")
            .bind(&self.name)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            warn!(lock = %self.name, "lock was reclaimed before release");
        } else {
            debug!(lock = %self.name, "lock released");
        }
        Ok(())
    }
}

impl Drop for SourceLock {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

fn renewal_interval(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_millis(50))
}

/// Push `acquired_at` forward until aborted or the row is no longer ours.
fn spawn_renewal(pool: Pool, name: String, holder: String, lease: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(renewal_interval(lease));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let renewed = sqlx::query(
                "UPDATE source_lock SET acquired_at = ? WHERE name = ? AND holder = ?",
            )
            .bind(Utc::now())
            .bind(&name)
            .bind(&holder)
            .execute(&pool)
            .await;
            match renewed {
                Ok(res) if res.rows_affected() == 1 => {}
                Ok(_) => {
                    warn!(lock = %name, "lock lost; renewal stopped");
                    return;
                }
                Err(err) => warn!(?err, lock = %name, "failed to renew lock lease"),
            }
        }
    })
}

/// Acquire `name`, polling until `wait` elapses.
#[instrument(skip_all, fields(lock = %name))]
pub async fn acquire_source_lock(
    pool: &Pool,
    name: &str,
    wait: Duration,
    lease: Duration,
) -> Result<SourceLock, IngestError> {
    let holder = Uuid::new_v4().to_string();
    let deadline = Instant::now() + wait;
    loop {
        if try_acquire(pool, name, &holder, lease).await? {
            debug!("lock acquired");
            let renewal = spawn_renewal(pool.clone(), name.to_string(), holder.clone(), lease);
            return Ok(SourceLock {
                pool: pool.clone(),
                name: name.to_string(),
                holder,
                renewal,
            });
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(IngestError::fatal(format!(
                "could not acquire lock {} within {}s",
                name,
                wait.as_secs()
            )));
        }
        tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
    }
}

async fn try_acquire(pool: &Pool, name: &str, holder: &str, lease: Duration) -> Result<bool> {
    let current = sqlx::query("SELECT holder, acquired_at FROM source_lock WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    if let Some(row) = current {
        let stale_holder: String = row.try_get("holder")?;
        let acquired_at: DateTime<Utc> = row.try_get("acquired_at")?;
        let age = Utc::now().signed_duration_since(acquired_at);
        if age.to_std().map(|age| age < lease).unwrap_or(true) {
            return Ok(false);
        }
        warn!(lock = %name, holder = %stale_holder, "reclaiming abandoned lock");
        sqlx::query("DELETE FROM source_lock WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(&stale_holder)
            .execute(pool)
            .await?;
    }
    let res = sqlx::query(
        "INSERT INTO source_lock (name, holder, acquired_at) VALUES (?, ?, ?) ON CONFLICT (name) DO NOTHING",
    )
    .bind(name)
    .bind(holder)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}
