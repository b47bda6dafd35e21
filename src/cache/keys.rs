//! Cache identifiers and payload digests.
//!
//! A [`CacheId`] is the SHA-256 of the page URL, hex encoded. Both stores use
//! it as their primary key so records correlate without a lookup.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length in characters of every [`CacheId`].
pub const CACHE_ID_LEN: usize = 64;

/// Deterministic identifier derived from a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheId(String);

impl CacheId {
    /// Derive the identifier for `key`. Pure and infallible.
    pub fn derive(key: &str) -> Self {
        Self(hex::encode(Sha256::digest(key.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character prefix used to fan out on-disk directories.
    pub fn shard(&self) -> &str {
        shard_of(&self.0)
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Incremental SHA-256 over a payload, the only hash used for stored content.
#[derive(Clone, Default)]
pub struct ContentDigest {
    hasher: Sha256,
}

impl ContentDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Finish the digest and return it as lowercase hex.
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    /// Digest a fully-buffered payload.
    pub fn of(payload: &[u8]) -> String {
        let mut digest = Self::new();
        digest.update(payload);
        digest.finalize()
    }
}

fn shard_of(hex: &str) -> &str {
    hex.get(..2).unwrap_or("00")
}
