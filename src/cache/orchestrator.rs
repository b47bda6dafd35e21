//! Lookup and store policy over the content store and the ledger.
//!
//! The two stores are never written transactionally. A successful render is
//! written to both: the payload as a blob and an inline copy as the ledger's
//! `last_good`. Lookups stream the blob when it is there and fall back to the
//! inline copy when it is not.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::{StreamExt, stream};
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::application::repos::{ByteStream, ContentStore, MetadataLedger, StoreError};
use crate::application::request::RequestContext;
use crate::domain::entities::{InlineValue, LastGood, RequestEvent};

use super::config::CacheConfig;
use super::keys::{CacheId, ContentDigest};
use super::response::{CachedResponse, HitSource};

pub(crate) const METRIC_GET_TOTAL: &str = "renderstash_get_total";
pub(crate) const METRIC_STORE_FAILURE_TOTAL: &str = "renderstash_store_failure_total";
pub(crate) const METRIC_BLOB_WRITE_MS: &str = "renderstash_blob_write_ms";

/// Chunk size used when handing a buffered payload to the content store.
const PAYLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Store handles, built once at startup and shared by every request.
#[derive(Clone)]
pub struct StoreContext {
    pub content: Arc<dyn ContentStore>,
    pub ledger: Arc<dyn MetadataLedger>,
}

impl StoreContext {
    pub fn new(content: Arc<dyn ContentStore>, ledger: Arc<dyn MetadataLedger>) -> Self {
        Self { content, ledger }
    }
}

#[derive(Clone)]
pub struct CacheOrchestrator {
    stores: StoreContext,
    config: CacheConfig,
}

impl CacheOrchestrator {
    pub fn new(stores: StoreContext, config: CacheConfig) -> Self {
        Self { stores, config }
    }

    pub fn stores(&self) -> &StoreContext {
        &self.stores
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look `key` up. Store failures are logged and treated as misses.
    #[instrument(skip_all, fields(request_id = %ctx.request_id, key = %key))]
    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Option<CachedResponse> {
        let id = CacheId::derive(key);
        let content = self.stores.content.as_ref();

        match content.open_read(&id).await {
            Ok(Some(reader)) if reader.record.filename == key => {
                debug!(cache_id = %id, outcome = "hit", "serving blob");
                record_get(HitSource::Primary.as_str());
                return Some(CachedResponse::primary(reader));
            }
            Ok(Some(reader)) => {
                warn!(
                    cache_id = %id,
                    stored_key = %reader.record.filename,
                    "blob belongs to a different key, ignoring it"
                );
            }
            Ok(None) => {
                debug!(cache_id = %id, store = content.name(), "blob not found");
            }
            Err(err) => {
                warn!(
                    cache_id = %id,
                    store = content.name(),
                    error = %err,
                    "blob lookup failed, trying ledger"
                );
                record_failure(content.name(), "read");
            }
        }

        let ledger = self.stores.ledger.as_ref();
        match ledger.fetch_fallback(key).await {
            Ok(Some(snapshot)) => match CachedResponse::degraded(snapshot) {
                Ok(response) => {
                    info!(cache_id = %id, outcome = "degraded", "serving ledger snapshot");
                    record_get(HitSource::Degraded.as_str());
                    Some(response)
                }
                Err(err) => {
                    warn!(cache_id = %id, store = ledger.name(), error = %err, "ledger snapshot is undecodable");
                    record_failure(ledger.name(), "read");
                    record_get("miss");
                    None
                }
            },
            Ok(None) => {
                debug!(cache_id = %id, outcome = "miss", "nothing cached");
                record_get("miss");
                None
            }
            Err(err) => {
                warn!(cache_id = %id, store = ledger.name(), error = %err, "ledger lookup failed");
                record_failure(ledger.name(), "read");
                record_get("miss");
                None
            }
        }
    }

    /// Record the rendered `value` for `key`.
    ///
    /// Successful renders go to both stores; anything else only appends to
    /// the ledger history. The two writes run concurrently and never fail
    /// the caller.
    ///
    /// The content store hashes the payload while writing it. The snapshot
    /// takes its own [`ContentDigest`] of the same bytes so the ledger write
    /// does not wait on the blob write, and keeps a hash when that write
    /// fails. Both digests are identical by construction.
    #[instrument(skip_all, fields(request_id = %ctx.request_id, key = %key, status = ctx.status_code))]
    pub async fn set(&self, ctx: &RequestContext, key: &str, value: Bytes) {
        let id = CacheId::derive(key);
        let success = ctx.is_success();
        let content_type = ctx
            .content_type
            .clone()
            .unwrap_or_else(|| self.config.default_content_type.clone());

        let event = RequestEvent {
            key: key.to_owned(),
            occurred_at: ctx.start,
            status_code: ctx.status_code,
            execution_time_ms: ctx.execution_time_ms(),
            user_agent: ctx.user_agent(),
            client_ip: ctx.client_ip(),
            recorded_at: OffsetDateTime::now_utc(),
            content_type: content_type.clone(),
            value: (!success).then(|| InlineValue::from_bytes(&value)),
        };

        let snapshot = success.then(|| LastGood {
            status_code: ctx.status_code,
            content_type: content_type.clone(),
            value: InlineValue::from_bytes(&value),
            content_hash: ContentDigest::of(&value),
        });

        let blob_write = async {
            if success {
                self.write_blob(&id, key, &content_type, value).await;
            }
        };
        let ledger_write = self.write_ledger(&id, key, event, snapshot);

        tokio::join!(blob_write, ledger_write);
    }

    async fn write_blob(&self, id: &CacheId, key: &str, content_type: &str, value: Bytes) {
        let content = self.stores.content.as_ref();
        let started_at = Instant::now();

        match content
            .write(id, key, content_type, payload_stream(value))
            .await
        {
            Ok(stored) => {
                histogram!(METRIC_BLOB_WRITE_MS)
                    .record(started_at.elapsed().as_secs_f64() * 1000.0);
                info!(
                    cache_id = %id,
                    content_hash = %stored.content_hash,
                    size_bytes = stored.size_bytes,
                    "blob saved"
                );
            }
            Err(err) => {
                warn!(
                    cache_id = %id,
                    store = content.name(),
                    error = %err,
                    "failed to store blob"
                );
                record_failure(content.name(), "write");
            }
        }
    }

    async fn write_ledger(
        &self,
        id: &CacheId,
        key: &str,
        event: RequestEvent,
        snapshot: Option<LastGood>,
    ) {
        let ledger = self.stores.ledger.as_ref();
        let replaces_last_good = snapshot.is_some();

        match ledger.record_event(key, id, event, snapshot).await {
            Ok(()) => {
                debug!(cache_id = %id, replaces_last_good, "ledger updated");
            }
            Err(err) => {
                warn!(
                    cache_id = %id,
                    store = ledger.name(),
                    error = %err,
                    "failed to record ledger event"
                );
                record_failure(ledger.name(), "write");
            }
        }
    }
}

/// Present a buffered payload as a chunked stream.
fn payload_stream(value: Bytes) -> ByteStream {
    let chunks: Vec<Result<Bytes, StoreError>> = if value.is_empty() {
        vec![Ok(value)]
    } else {
        (0..value.len())
            .step_by(PAYLOAD_CHUNK_BYTES)
            .map(|offset| Ok(value.slice(offset..value.len().min(offset + PAYLOAD_CHUNK_BYTES))))
            .collect()
    };
    stream::iter(chunks).boxed()
}

fn record_get(outcome: &'static str) {
    counter!(METRIC_GET_TOTAL, "outcome" => outcome).increment(1);
}

fn record_failure(store: &'static str, op: &'static str) {
    counter!(METRIC_STORE_FAILURE_TOTAL, "store" => store, "op" => op).increment(1);
}
