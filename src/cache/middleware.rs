//! Prerender cache middleware.
//!
//! Wraps a render handler with [`PrerenderCache::before_request`] and
//! [`PrerenderCache::after_request`]. The page URL is taken from the request
//! path the way prerender services address pages: `GET /https://site/page`.

use std::net::SocketAddr;

use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::application::request::RequestContext;

use super::plugin::PrerenderCache;
use super::response::CachedResponse;

pub const CACHE_STATUS_HEADER: &str = "x-renderstash-cache";

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn prerender_cache_layer(
    State(cache): State<PrerenderCache>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut ctx = RequestContext::new(target_url(request.uri()), request.method().clone());
    ctx.headers = request.headers().clone();
    ctx.remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if let Some(cached) = cache.before_request(&ctx).await {
        return build_response(cached);
    }

    ctx.download_started = Some(OffsetDateTime::now_utc());
    let response = next.run(request).await;
    ctx.download_finished = Some(OffsetDateTime::now_utc());

    ctx.status_code = response.status().as_u16();
    ctx.content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let limit = cache.orchestrator().config().response_body_limit_bytes;
    if declared_len(&response).is_some_and(|len| len > limit as u64) {
        debug!(request_id = %ctx.request_id, limit, "rendered body over limit, not caching");
        return response;
    }

    let (parts, body) = response.into_parts();
    let hint = body.size_hint();
    if hint.exact().is_some() {
        // Exact-size bodies are already in memory and within the limit.
        return match axum::body::to_bytes(body, limit).await {
            Ok(bytes) => {
                cache.after_request(ctx, bytes.clone());
                Response::from_parts(parts, Body::from(bytes))
            }
            Err(err) => {
                warn!(request_id = %ctx.request_id, error = %err, "rendered body unreadable, not caching");
                StatusCode::BAD_GATEWAY.into_response()
            }
        };
    }

    let capture = BodyCapture {
        cache,
        ctx: Some(ctx),
        buffer: BytesMut::new(),
        limit,
    };
    let stream = stream::unfold(
        (body.into_data_stream(), capture),
        |(mut inner, mut capture)| async move {
            match inner.next().await {
                Some(Ok(chunk)) => {
                    capture.push(&chunk);
                    Some((Ok(chunk), (inner, capture)))
                }
                Some(Err(err)) => {
                    capture.abandon();
                    Some((Err(err), (inner, capture)))
                }
                None => {
                    capture.finish();
                    None
                }
            }
        },
    );

    Response::from_parts(parts, Body::from_stream(stream))
}

fn declared_len(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .or_else(|| Some(response.body().size_hint().lower()).filter(|len| *len > 0))
}

/// Copies a streamed render as it reaches the client. The copy is stored
/// only if the stream ends cleanly within the limit.
struct BodyCapture {
    cache: PrerenderCache,
    ctx: Option<RequestContext>,
    buffer: BytesMut,
    limit: usize,
}

impl BodyCapture {
    fn push(&mut self, chunk: &Bytes) {
        let Some(ctx) = &self.ctx else {
            return;
        };
        if self.buffer.len() + chunk.len() > self.limit {
            debug!(request_id = %ctx.request_id, limit = self.limit, "rendered body over limit, not caching");
            self.abandon();
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    fn abandon(&mut self) {
        self.ctx = None;
        self.buffer = BytesMut::new();
    }

    fn finish(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let value = std::mem::take(&mut self.buffer).freeze();
            self.cache.after_request(ctx, value);
        }
    }
}

/// Page URL addressed by a request: an absolute URL embedded in the path, or
/// the path and query themselves.
pub fn target_url(uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    let embedded = path_and_query.trim_start_matches('/');

    if embedded.starts_with("http://") || embedded.starts_with("https://") {
        embedded.to_string()
    } else {
        path_and_query.to_string()
    }
}

fn build_response(cached: CachedResponse) -> Response {
    let mut builder = Response::builder()
        .status(cached.status_code)
        .header(CACHE_STATUS_HEADER, cached.source.as_str());

    if let Ok(content_type) = HeaderValue::from_str(&cached.content_type) {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", cached.content_hash)) {
        builder = builder.header(header::ETAG, etag);
    }

    builder
        .body(Body::from_stream(cached.body.into_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_absolute_url_is_the_key() {
        let uri: Uri = "/https://example.com/page?ref=1".parse().unwrap();
        assert_eq!(target_url(&uri), "https://example.com/page?ref=1");
    }

    #[test]
    fn plain_path_is_kept_with_query() {
        let uri: Uri = "/posts/hello?page=2".parse().unwrap();
        assert_eq!(target_url(&uri), "/posts/hello?page=2");
    }

    #[test]
    fn root_path() {
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(target_url(&uri), "/");
    }
}
