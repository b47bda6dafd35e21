//! Postgres-backed metadata ledger.

mod ledger;
mod util;

pub use ledger::{DEFAULT_LEDGER_TABLE, PostgresLedger};
pub use util::{is_valid_identifier, map_sqlx_error};

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Open a connection pool against `url`.
pub async fn connect(
    url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(url)
        .await
}
