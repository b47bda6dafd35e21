//! Request context handed over by the rendering pipeline.

use std::net::IpAddr;

use axum::http::{HeaderMap, Method, header::USER_AGENT};
use time::OffsetDateTime;
use uuid::Uuid;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// What the pipeline knows about one page request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlates every log line emitted for this request.
    pub request_id: String,
    /// The page URL; used as the cache key.
    pub url: String,
    pub method: Method,
    /// Status of the rendered response. Meaningless before rendering.
    pub status_code: u16,
    /// When the pipeline started handling the request.
    pub start: OffsetDateTime,
    pub download_started: Option<OffsetDateTime>,
    pub download_finished: Option<OffsetDateTime>,
    pub content_type: Option<String>,
    pub headers: HeaderMap,
    pub remote_addr: Option<IpAddr>,
}

impl RequestContext {
    pub fn new(url: impl Into<String>, method: Method) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            url: url.into(),
            method,
            status_code: 200,
            start: OffsetDateTime::now_utc(),
            download_started: None,
            download_finished: None,
            content_type: None,
            headers: HeaderMap::new(),
            remote_addr: None,
        }
    }

    /// 2xx responses are cached; everything else is only recorded.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Client address: the leftmost non-empty `x-forwarded-for` entry, then
    /// the connection peer. `None` when neither is known.
    pub fn client_ip(&self) -> Option<String> {
        let forwarded = self
            .headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .find(|entry| !entry.is_empty());

        forwarded
            .map(str::to_owned)
            .or_else(|| self.remote_addr.map(|addr| addr.to_string()))
    }

    pub fn user_agent(&self) -> Option<String> {
        self.headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    /// Time spent fetching and rendering, in milliseconds.
    pub fn execution_time_ms(&self) -> Option<i64> {
        let started = self.download_started?;
        let finished = self.download_finished?;
        i64::try_from((finished - started).whole_milliseconds()).ok()
    }
}
