//! Cron job removing ledger records past the retention window.

use std::str::FromStr;
use std::sync::Arc;

use apalis::prelude::*;
use apalis_cron::Schedule;

use crate::application::repos::MetadataLedger;
use crate::cache::RetentionPolicy;
use crate::infra::error::InfraError;

/// Marker struct for the cron-triggered sweep.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron compatibility.
#[derive(Default, Debug, Clone)]
pub struct PruneHistoryJob;

impl From<chrono::DateTime<chrono::Utc>> for PruneHistoryJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

#[derive(Clone)]
pub struct PruneHistoryContext {
    pub ledger: Arc<dyn MetadataLedger>,
    pub policy: RetentionPolicy,
}

/// Sweep expired records. Failures are logged and retried on the next tick.
pub async fn process_prune_history_job(
    _job: PruneHistoryJob,
    ctx: Data<PruneHistoryContext>,
) -> Result<(), apalis::prelude::Error> {
    match ctx.policy.sweep(ctx.ledger.as_ref()).await {
        Ok(removed) => {
            tracing::debug!(removed, "History sweep finished");
        }
        Err(err) => {
            tracing::warn!(
                ledger = ctx.ledger.name(),
                error = %err,
                "Failed to prune expired history"
            );
        }
    }
    Ok(())
}

pub fn prune_history_schedule(expression: &str) -> Result<Schedule, InfraError> {
    Schedule::from_str(expression).map_err(|err| {
        InfraError::scheduler(format!("invalid cron expression `{expression}`: {err}"))
    })
}
