//! Responses produced by a cache lookup.

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt, stream};

use crate::application::repos::{BlobReader, ByteStream, StoreError};
use crate::domain::entities::LastGood;

/// Which store satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    /// Streamed from the content store.
    Primary,
    /// Served from the ledger's inline `last_good` copy.
    Degraded,
}

impl HitSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "hit",
            Self::Degraded => "degraded",
        }
    }
}

pub enum CachedBody {
    Stream(ByteStream),
    Inline(Bytes),
}

impl CachedBody {
    pub fn into_stream(self) -> ByteStream {
        match self {
            Self::Stream(stream) => stream,
            Self::Inline(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
        }
    }

    /// Drain the body into memory.
    pub async fn collect(self) -> Result<Bytes, StoreError> {
        match self {
            Self::Inline(bytes) => Ok(bytes),
            Self::Stream(stream) => {
                let buffer = stream
                    .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
                        buffer.extend_from_slice(&chunk);
                        Ok(buffer)
                    })
                    .await?;
                Ok(buffer.freeze())
            }
        }
    }
}

impl std::fmt::Debug for CachedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("CachedBody::Stream(..)"),
            Self::Inline(bytes) => write!(f, "CachedBody::Inline({} bytes)", bytes.len()),
        }
    }
}

/// A cache hit, ready to be served instead of rendering.
#[derive(Debug)]
pub struct CachedResponse {
    pub status_code: u16,
    pub content_type: String,
    pub content_hash: String,
    pub source: HitSource,
    pub body: CachedBody,
}

impl CachedResponse {
    pub(crate) fn primary(reader: BlobReader) -> Self {
        Self {
            status_code: 200,
            content_type: reader.record.content_type,
            content_hash: reader.record.content_hash,
            source: HitSource::Primary,
            body: CachedBody::Stream(reader.stream),
        }
    }

    pub(crate) fn degraded(snapshot: LastGood) -> Result<Self, base64::DecodeError> {
        let body = snapshot.value.to_bytes()?;
        Ok(Self {
            status_code: snapshot.status_code,
            content_type: snapshot.content_type,
            content_hash: snapshot.content_hash,
            source: HitSource::Degraded,
            body: CachedBody::Inline(body),
        })
    }

    pub async fn into_bytes(self) -> Result<Bytes, StoreError> {
        self.body.collect().await
    }
}
