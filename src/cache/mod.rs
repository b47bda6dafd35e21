//! Prerender cache.
//!
//! Coordinates two independently consistent stores:
//!
//! - **Content store**: blobs holding rendered pages, named by key and digest
//! - **Ledger**: one document per URL with request history and an inline
//!   copy of the last successful response
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//!
//! [retention]
//! seconds = 7776000
//! # ... see config.rs for all options
//! ```

mod config;
mod keys;
mod middleware;
mod orchestrator;
mod plugin;
mod response;
mod retention;

pub use config::{CacheConfig, DEFAULT_CONTENT_TYPE, DEFAULT_RETENTION_SECS};
pub use keys::{CACHE_ID_LEN, CacheId, ContentDigest};
pub use middleware::{CACHE_STATUS_HEADER, prerender_cache_layer, target_url};
pub use orchestrator::{CacheOrchestrator, StoreContext};
pub use plugin::PrerenderCache;
pub use response::{CachedBody, CachedResponse, HitSource};
pub use retention::RetentionPolicy;

