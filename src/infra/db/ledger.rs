use async_trait::async_trait;
use sqlx::{PgPool, types::Json};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{
    application::repos::{MetadataLedger, StoreError},
    cache::{CacheId, RetentionPolicy},
    domain::entities::{LastGood, MetadataRecord, RequestEvent},
    infra::error::InfraError,
};

use super::{is_valid_identifier, map_sqlx_error};

pub const DEFAULT_LEDGER_TABLE: &str = "pages_meta";

/// One row per cache id. `history` is a JSONB array appended in place so
/// concurrent writers never lose each other's events.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    table: String,
    retention: RetentionPolicy,
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: String,
    key: String,
    created: OffsetDateTime,
    updated: OffsetDateTime,
    last_good: Option<Json<LastGood>>,
    history: Json<Vec<RequestEvent>>,
}

impl TryFrom<LedgerRow> for MetadataRecord {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let id = CacheId::derive(&row.key);
        if id.as_str() != row.id {
            return Err(StoreError::corrupt(
                "ledger",
                format!("row {} does not match its key", row.id),
            ));
        }
        Ok(Self {
            id,
            key: row.key,
            created: row.created,
            updated: row.updated,
            last_good: row.last_good.map(|Json(last_good)| last_good),
            history: row.history.0,
        })
    }
}

impl PostgresLedger {
    pub fn new(
        pool: PgPool,
        table: impl Into<String>,
        retention: RetentionPolicy,
    ) -> Result<Self, InfraError> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(InfraError::configuration(format!(
                "`{table}` is not a valid ledger table name"
            )));
        }
        Ok(Self {
            pool,
            table,
            retention,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn provision_statements(&self) -> [String; 3] {
        let table = &self.table;
        [
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id TEXT PRIMARY KEY, \
                 key TEXT NOT NULL, \
                 created TIMESTAMPTZ NOT NULL, \
                 updated TIMESTAMPTZ NOT NULL, \
                 last_good JSONB, \
                 history JSONB NOT NULL DEFAULT '[]'::jsonb)"
            ),
            format!("CREATE INDEX IF NOT EXISTS {table}_key_idx ON {table} (key)"),
            format!("CREATE INDEX IF NOT EXISTS {table}_updated_auto_expire ON {table} (updated)"),
        ]
    }

    fn live_cutoff(&self) -> OffsetDateTime {
        self.retention.cutoff(OffsetDateTime::now_utc())
    }
}

#[async_trait]
impl MetadataLedger for PostgresLedger {
    fn name(&self) -> &'static str {
        "ledger"
    }

    async fn provision(&self) -> Result<(), StoreError> {
        for statement in self.provision_statements() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        info!(table = %self.table, "Ledger table and indexes ready");
        Ok(())
    }

    async fn record_event(
        &self,
        key: &str,
        id: &CacheId,
        event: RequestEvent,
        snapshot: Option<LastGood>,
    ) -> Result<(), StoreError> {
        let statement = format!(
            "INSERT INTO {table} AS ledger (id, key, created, updated, last_good, history) \
             VALUES ($1, $2, $3, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET \
                 updated = EXCLUDED.updated, \
                 history = ledger.history || EXCLUDED.history, \
                 last_good = COALESCE(EXCLUDED.last_good, ledger.last_good)",
            table = self.table
        );
        let recorded_at = event.recorded_at;

        let result = sqlx::query(&statement)
            .bind(id.as_str())
            .bind(key)
            .bind(recorded_at)
            .bind(snapshot.map(Json))
            .bind(Json(vec![event]))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        debug!(cache_id = %id, rows = result.rows_affected(), "Ledger event recorded");
        Ok(())
    }

    async fn fetch_fallback(&self, key: &str) -> Result<Option<LastGood>, StoreError> {
        let statement = format!(
            "SELECT last_good FROM {table} \
             WHERE key = $1 AND updated >= $2 AND last_good IS NOT NULL \
             ORDER BY updated DESC LIMIT 1",
            table = self.table
        );

        let row: Option<(Json<LastGood>,)> = sqlx::query_as(&statement)
            .bind(key)
            .bind(self.live_cutoff())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(|(Json(last_good),)| last_good))
    }

    async fn find_record(&self, key: &str) -> Result<Option<MetadataRecord>, StoreError> {
        let statement = format!(
            "SELECT id, key, created, updated, last_good, history FROM {table} \
             WHERE key = $1 AND updated >= $2 \
             ORDER BY updated DESC LIMIT 1",
            table = self.table
        );

        let row: Option<LedgerRow> = sqlx::query_as(&statement)
            .bind(key)
            .bind(self.live_cutoff())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(MetadataRecord::try_from).transpose()
    }

    async fn prune_expired(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let statement = format!("DELETE FROM {table} WHERE updated < $1", table = self.table);

        let result = sqlx::query(&statement)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/renderstash")
            .expect("lazy pool")
    }

    #[tokio::test]
    async fn rejects_unsafe_table_names() {
        let result = PostgresLedger::new(lazy_pool(), "pages; drop", RetentionPolicy::default());
        assert!(matches!(result, Err(InfraError::Configuration { .. })));
    }

    #[tokio::test]
    async fn provision_creates_table_and_both_indexes() {
        let ledger = PostgresLedger::new(lazy_pool(), DEFAULT_LEDGER_TABLE, RetentionPolicy::default())
            .expect("ledger");
        let [table, key_idx, expire_idx] = ledger.provision_statements();
        assert!(table.starts_with("CREATE TABLE IF NOT EXISTS pages_meta"));
        assert!(key_idx.contains("pages_meta_key_idx ON pages_meta (key)"));
        assert!(expire_idx.contains("pages_meta_updated_auto_expire ON pages_meta (updated)"));
    }
}
