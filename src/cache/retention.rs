//! Time-to-live rule over ledger records.
//!
//! Postgres has no TTL index, so expiry is a sweep driven by the
//! `prune-history` cron job. Ledgers also apply [`RetentionPolicy::cutoff`]
//! on reads so an expired record disappears before the sweep reaches it.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, instrument};

use crate::application::repos::{MetadataLedger, StoreError};

use super::config::DEFAULT_RETENTION_SECS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    window: Duration,
}

impl RetentionPolicy {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records updated strictly before this instant are expired.
    pub fn cutoff(&self, now: OffsetDateTime) -> OffsetDateTime {
        time::Duration::try_from(self.window)
            .ok()
            .and_then(|window| now.checked_sub(window))
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn is_expired(&self, updated: OffsetDateTime, now: OffsetDateTime) -> bool {
        updated < self.cutoff(now)
    }

    /// Remove every expired record from `ledger`, returning how many went.
    #[instrument(skip_all, fields(ledger = ledger.name(), window_secs = self.window.as_secs()))]
    pub async fn sweep(&self, ledger: &dyn MetadataLedger) -> Result<u64, StoreError> {
        let cutoff = self.cutoff(OffsetDateTime::now_utc());
        let removed = ledger.prune_expired(cutoff).await?;
        if removed > 0 {
            info!(removed, %cutoff, "Pruned expired ledger records");
        }
        Ok(removed)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_RETENTION_SECS))
    }
}
