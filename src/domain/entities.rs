//! Domain entities mirrored from persistent storage.

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cache::CacheId;

/// Metadata stored alongside a blob in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: CacheId,
    /// The cache key the blob was stored under.
    pub filename: String,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
    pub content_type: String,
    pub content_hash: String,
    pub size_bytes: u64,
}

/// A payload inlined into a ledger document.
///
/// UTF-8 payloads are kept as text so the ledger stays readable; anything
/// else is base64 encoded so it comes back byte for byte. Text containing
/// NUL is encoded too, since JSONB rejects `\u0000`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum InlineValue {
    Text(String),
    Base64(String),
}

impl InlineValue {
    pub fn from_bytes(payload: &[u8]) -> Self {
        match std::str::from_utf8(payload) {
            Ok(text) if !text.contains('\0') => Self::Text(text.to_owned()),
            _ => Self::Base64(STANDARD.encode(payload)),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, base64::DecodeError> {
        match self {
            Self::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Self::Base64(encoded) => STANDARD.decode(encoded).map(Bytes::from),
        }
    }
}

/// Snapshot of the most recent successful response for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastGood {
    pub status_code: u16,
    pub content_type: String,
    pub value: InlineValue,
    pub content_hash: String,
}

/// One request observed for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub status_code: u16,
    pub execution_time_ms: Option<i64>,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub content_type: String,
    /// Raw payload, only present when the response was not a success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<InlineValue>,
}

/// Ledger document, one per [`CacheId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: CacheId,
    pub key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
    pub last_good: Option<LastGood>,
    pub history: Vec<RequestEvent>,
}

impl MetadataRecord {
    /// Start a record for the first event seen for `key`.
    pub fn first(id: CacheId, key: &str, at: OffsetDateTime) -> Self {
        Self {
            id,
            key: key.to_owned(),
            created: at,
            updated: at,
            last_good: None,
            history: Vec::new(),
        }
    }

    /// Apply one `record_event` mutation in memory.
    pub fn apply(&mut self, event: RequestEvent, snapshot: Option<LastGood>) {
        self.updated = event.recorded_at;
        if let Some(snapshot) = snapshot {
            self.last_good = Some(snapshot);
        }
        self.history.push(event);
    }
}
