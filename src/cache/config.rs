//! Cache configuration.
//!
//! Resolved from the `[cache]` and `[retention]` sections of `renderstash.toml`.

use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_RETENTION_SECS: u64 = 7_776_000;
pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const DEFAULT_RESPONSE_BODY_LIMIT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve and record through the cache at all.
    pub enabled: bool,
    /// How long a ledger record survives after its last update.
    pub retention_seconds: u64,
    /// Content type recorded when the pipeline did not report one.
    pub default_content_type: String,
    /// Largest rendered body the middleware will buffer for storage.
    pub response_body_limit_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_seconds: DEFAULT_RETENTION_SECS,
            default_content_type: DEFAULT_CONTENT_TYPE.to_string(),
            response_body_limit_bytes: DEFAULT_RESPONSE_BODY_LIMIT_BYTES,
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            enabled: settings.cache.enabled,
            retention_seconds: settings.retention.window.as_secs(),
            default_content_type: settings.cache.default_content_type.clone(),
            response_body_limit_bytes: settings.cache.response_body_limit_bytes,
        }
    }
}

impl CacheConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}
