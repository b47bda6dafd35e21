//! Hooks the rendering pipeline calls around a render.

use axum::http::Method;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span};

use crate::application::request::RequestContext;

use super::orchestrator::CacheOrchestrator;
use super::response::CachedResponse;

#[derive(Clone)]
pub struct PrerenderCache {
    orchestrator: CacheOrchestrator,
}

impl PrerenderCache {
    pub fn new(orchestrator: CacheOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &CacheOrchestrator {
        &self.orchestrator
    }

    /// Called before rendering. A `Some` short-circuits the render.
    ///
    /// Only `GET` requests are served from the cache.
    pub async fn before_request(&self, ctx: &RequestContext) -> Option<CachedResponse> {
        if !self.orchestrator.config().enabled {
            return None;
        }
        if ctx.method != Method::GET {
            debug!(request_id = %ctx.request_id, method = %ctx.method, "skipping cache lookup");
            return None;
        }
        self.orchestrator.get(ctx, &ctx.url).await
    }

    /// Called after every render. Persistence runs in the background; the
    /// returned handle may be dropped.
    pub fn after_request(&self, ctx: RequestContext, value: Bytes) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let span = info_span!("after_request", request_id = %ctx.request_id);
        tokio::spawn(
            async move {
                if orchestrator.config().enabled {
                    orchestrator.set(&ctx, &ctx.url, value).await;
                }
            }
            .instrument(span),
        )
    }
}
