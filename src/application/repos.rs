//! Store traits describing the two persistence adapters behind the cache.

use std::error::Error as StdError;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use time::OffsetDateTime;

use crate::cache::CacheId;
use crate::domain::entities::{ContentRecord, LastGood, MetadataRecord, RequestEvent};

/// Single-pass stream of payload chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, StoreError>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{store} unavailable: {message}")]
    Unavailable { store: &'static str, message: String },
    #[error("{store} rejected write: {message}")]
    WriteFailure { store: &'static str, message: String },
    #[error("{store} holds an unreadable record: {message}")]
    Corrupt { store: &'static str, message: String },
    #[error("payload stream failed")]
    Stream {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("invalid stored path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn unavailable(store: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            store,
            message: message.to_string(),
        }
    }

    pub fn write_failure(store: &'static str, message: impl std::fmt::Display) -> Self {
        Self::WriteFailure {
            store,
            message: message.to_string(),
        }
    }

    pub fn corrupt(store: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            store,
            message: message.to_string(),
        }
    }

    pub fn stream(source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Stream {
            source: source.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// An open blob: its metadata and a lazily consumed payload stream.
pub struct BlobReader {
    pub record: ContentRecord,
    pub stream: ByteStream,
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// Outcome of a committed blob write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub content_hash: String,
    pub uploaded_at: OffsetDateTime,
    pub size_bytes: u64,
}

/// Content-addressed blob repository keyed by [`CacheId`].
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Short store name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Metadata of the blob stored for `id`, without opening the payload.
    async fn stat(&self, id: &CacheId) -> Result<Option<ContentRecord>, StoreError>;

    async fn exists(&self, id: &CacheId) -> Result<bool, StoreError> {
        Ok(self.stat(id).await?.is_some())
    }

    /// True when a blob exists for `key` and was stored under that exact key.
    async fn exists_by_key(&self, key: &str) -> Result<bool, StoreError> {
        let record = self.stat(&CacheId::derive(key)).await?;
        Ok(record.is_some_and(|record| record.filename == key))
    }

    /// Open the blob for reading. `Ok(None)` means not cached.
    async fn open_read(&self, id: &CacheId) -> Result<Option<BlobReader>, StoreError>;

    /// Consume `payload`, hash it and commit it as the blob for `id`,
    /// replacing any previous blob. Readers never observe a partial blob.
    async fn write(
        &self,
        id: &CacheId,
        key: &str,
        content_type: &str,
        payload: ByteStream,
    ) -> Result<StoredBlob, StoreError>;
}

/// Per-key document store holding request history and the last good response.
#[async_trait]
pub trait MetadataLedger: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create backing structures and indexes if they are missing.
    async fn provision(&self) -> Result<(), StoreError>;

    /// Atomically upsert the record for `id`: set `created` on insert, refresh
    /// `updated`, append `event`, and replace `last_good` iff `snapshot` is set.
    async fn record_event(
        &self,
        key: &str,
        id: &CacheId,
        event: RequestEvent,
        snapshot: Option<LastGood>,
    ) -> Result<(), StoreError>;

    /// Current `last_good` for `key`, ignoring records past retention.
    async fn fetch_fallback(&self, key: &str) -> Result<Option<LastGood>, StoreError>;

    /// Full record for `key`, ignoring records past retention.
    async fn find_record(&self, key: &str) -> Result<Option<MetadataRecord>, StoreError>;

    /// Remove records whose `updated` is older than `cutoff`.
    async fn prune_expired(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError>;
}
