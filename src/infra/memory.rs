//! In-process store implementations.
//!
//! Used by tests and by embedders that want the cache policy without running
//! Postgres. Both stores can be switched into an "unavailable" state to
//! exercise degraded paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use time::OffsetDateTime;
use tracing::warn;

use crate::application::repos::{
    BlobReader, ByteStream, ContentStore, MetadataLedger, StoreError, StoredBlob,
};
use crate::cache::{CacheId, ContentDigest, RetentionPolicy};
use crate::domain::entities::{ContentRecord, LastGood, MetadataRecord, RequestEvent};

const CONTENT_STORE: &str = "memory-content";
const LEDGER_STORE: &str = "memory-ledger";

/// Entries of one in-memory store together with its outage switch.
///
/// A panic while holding the lock leaves the map as it was at that point;
/// later callers keep using it rather than failing every request.
struct Shelf<T> {
    store: &'static str,
    entries: RwLock<HashMap<CacheId, T>>,
    offline: AtomicBool,
}

impl<T> Shelf<T> {
    fn new(store: &'static str) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(self.store, "store offline"));
        }
        Ok(())
    }

    fn read(&self, op: &'static str) -> RwLockReadGuard<'_, HashMap<CacheId, T>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| self.recover(op, poisoned))
    }

    fn write(&self, op: &'static str) -> RwLockWriteGuard<'_, HashMap<CacheId, T>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| self.recover(op, poisoned))
    }

    fn recover<G>(&self, op: &'static str, poisoned: PoisonError<G>) -> G {
        warn!(store = self.store, op, "store lock poisoned, continuing with its entries");
        poisoned.into_inner()
    }

    fn len(&self) -> usize {
        self.read("len").len()
    }
}

pub struct MemoryContentStore {
    blobs: Shelf<(ContentRecord, Bytes)>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self {
            blobs: Shelf::new(CONTENT_STORE),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.blobs.set_offline(unavailable);
    }

    /// Drop the blob for `id`, as if it had been purged.
    pub fn remove(&self, id: &CacheId) -> bool {
        self.blobs.write("remove").remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    fn name(&self) -> &'static str {
        CONTENT_STORE
    }

    async fn stat(&self, id: &CacheId) -> Result<Option<ContentRecord>, StoreError> {
        self.blobs.ensure_online()?;
        Ok(self
            .blobs
            .read("stat")
            .get(id)
            .map(|(record, _)| record.clone()))
    }

    async fn open_read(&self, id: &CacheId) -> Result<Option<BlobReader>, StoreError> {
        self.blobs.ensure_online()?;
        let entry = self.blobs.read("open_read").get(id).cloned();
        Ok(entry.map(|(record, payload)| BlobReader {
            record,
            stream: stream::once(async move { Ok(payload) }).boxed(),
        }))
    }

    async fn write(
        &self,
        id: &CacheId,
        key: &str,
        content_type: &str,
        mut payload: ByteStream,
    ) -> Result<StoredBlob, StoreError> {
        self.blobs.ensure_online()?;

        let mut buffer = BytesMut::new();
        let mut digest = ContentDigest::new();
        while let Some(chunk) = payload.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            buffer.extend_from_slice(&chunk);
        }

        let stored = StoredBlob {
            content_hash: digest.finalize(),
            uploaded_at: OffsetDateTime::now_utc(),
            size_bytes: buffer.len() as u64,
        };
        let record = ContentRecord {
            id: id.clone(),
            filename: key.to_owned(),
            uploaded_at: stored.uploaded_at,
            content_type: content_type.to_owned(),
            content_hash: stored.content_hash.clone(),
            size_bytes: stored.size_bytes,
        };

        self.blobs
            .write("write")
            .insert(id.clone(), (record, buffer.freeze()));
        Ok(stored)
    }
}

pub struct MemoryLedger {
    records: Shelf<MetadataRecord>,
    retention: RetentionPolicy,
}

impl MemoryLedger {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            records: Shelf::new(LEDGER_STORE),
            retention,
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.records.set_offline(unavailable);
    }

    /// Overwrite the `updated` timestamp of the record stored under `id`.
    pub fn set_updated(&self, id: &CacheId, updated: OffsetDateTime) -> bool {
        match self.records.write("set_updated").get_mut(id) {
            Some(record) => {
                record.updated = updated;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_record(&self, key: &str) -> Option<MetadataRecord> {
        let now = OffsetDateTime::now_utc();
        self.records
            .read("live_record")
            .get(&CacheId::derive(key))
            .filter(|record| record.key == key && !self.retention.is_expired(record.updated, now))
            .cloned()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

#[async_trait]
impl MetadataLedger for MemoryLedger {
    fn name(&self) -> &'static str {
        LEDGER_STORE
    }

    async fn provision(&self) -> Result<(), StoreError> {
        self.records.ensure_online()
    }

    async fn record_event(
        &self,
        key: &str,
        id: &CacheId,
        event: RequestEvent,
        snapshot: Option<LastGood>,
    ) -> Result<(), StoreError> {
        self.records.ensure_online()?;
        self.records
            .write("record_event")
            .entry(id.clone())
            .or_insert_with(|| MetadataRecord::first(id.clone(), key, event.recorded_at))
            .apply(event, snapshot);
        Ok(())
    }

    async fn fetch_fallback(&self, key: &str) -> Result<Option<LastGood>, StoreError> {
        self.records.ensure_online()?;
        Ok(self.live_record(key).and_then(|record| record.last_good))
    }

    async fn find_record(&self, key: &str) -> Result<Option<MetadataRecord>, StoreError> {
        self.records.ensure_online()?;
        Ok(self.live_record(key))
    }

    async fn prune_expired(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        self.records.ensure_online()?;
        let mut records = self.records.write("prune_expired");
        let before = records.len();
        records.retain(|_, record| record.updated >= cutoff);
        Ok((before - records.len()) as u64)
    }
}
