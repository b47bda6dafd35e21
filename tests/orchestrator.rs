use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use bytes::Bytes;
use renderstash::application::repos::MetadataLedger;
use renderstash::application::request::RequestContext;
use renderstash::cache::{
    CacheConfig, CacheId, CacheOrchestrator, ContentDigest, HitSource, RetentionPolicy,
    StoreContext,
};
use renderstash::domain::entities::InlineValue;
use renderstash::infra::memory::{MemoryContentStore, MemoryLedger};
use time::macros::datetime;

struct Harness {
    content: Arc<MemoryContentStore>,
    ledger: Arc<MemoryLedger>,
    cache: CacheOrchestrator,
}

fn harness() -> Harness {
    harness_with_retention(RetentionPolicy::default())
}

fn harness_with_retention(retention: RetentionPolicy) -> Harness {
    let content = Arc::new(MemoryContentStore::new());
    let ledger = Arc::new(MemoryLedger::new(retention));
    let cache = CacheOrchestrator::new(
        StoreContext::new(content.clone(), ledger.clone()),
        CacheConfig::default(),
    );
    Harness {
        content,
        ledger,
        cache,
    }
}

fn rendered(url: &str, status_code: u16) -> RequestContext {
    let mut ctx = RequestContext::new(url, Method::GET);
    ctx.status_code = status_code;
    ctx.content_type = Some("text/html".to_string());
    ctx
}

fn lookup(url: &str) -> RequestContext {
    RequestContext::new(url, Method::GET)
}

#[tokio::test]
async fn ok_then_error_keeps_serving_the_ok_render() {
    let h = harness();

    h.cache
        .set(&rendered("http://a", 200), "http://a", Bytes::from_static(b"ok"))
        .await;
    h.cache
        .set(&rendered("http://a", 500), "http://a", Bytes::from_static(b"err"))
        .await;

    let hit = h.cache.get(&lookup("http://a"), "http://a").await.expect("cached");
    assert_eq!(hit.source, HitSource::Primary);
    assert_eq!(hit.status_code, 200);
    assert_eq!(hit.into_bytes().await.expect("body"), "ok");

    let record = h
        .ledger
        .find_record("http://a")
        .await
        .expect("ledger")
        .expect("record");
    assert_eq!(record.id, CacheId::derive("http://a"));
    assert_eq!(record.history.len(), 2);
    assert_eq!(record.history[0].status_code, 200);
    assert_eq!(record.history[0].value, None);
    assert_eq!(record.history[1].status_code, 500);
    assert_eq!(
        record.history[1].value,
        Some(InlineValue::Text("err".to_string()))
    );

    let last_good = record.last_good.expect("last good");
    assert_eq!(last_good.value, InlineValue::Text("ok".to_string()));
    assert_eq!(last_good.content_hash, ContentDigest::of(b"ok"));
}

#[tokio::test]
async fn successful_set_round_trips_alongside_other_keys() {
    let h = harness();

    let writes = (0..16).map(|n| {
        let cache = h.cache.clone();
        async move {
            let url = format!("http://site/{n}");
            cache
                .set(&rendered(&url, 200), &url, Bytes::from(format!("page {n}")))
                .await;
        }
    });
    let target = async {
        h.cache
            .set(
                &rendered("http://site/target", 200),
                "http://site/target",
                Bytes::from_static(b"<html>target</html>"),
            )
            .await;
    };
    tokio::join!(futures::future::join_all(writes), target);

    let hit = h
        .cache
        .get(&lookup("http://site/target"), "http://site/target")
        .await
        .expect("cached");
    assert_eq!(hit.source, HitSource::Primary);
    assert_eq!(hit.content_hash, ContentDigest::of(b"<html>target</html>"));
    assert_eq!(
        hit.into_bytes().await.expect("body"),
        "<html>target</html>"
    );
    assert_eq!(h.content.len(), 17);
    assert_eq!(h.ledger.len(), 17);
}

#[tokio::test]
async fn primary_and_degraded_hits_share_one_digest() {
    let h = harness();
    let payload = Bytes::from_static(b"<html>digest</html>");

    h.cache
        .set(&rendered("http://a", 200), "http://a", payload.clone())
        .await;

    let primary = h.cache.get(&lookup("http://a"), "http://a").await.expect("primary hit");
    assert_eq!(primary.source, HitSource::Primary);
    let primary_hash = primary.content_hash.clone();

    assert!(h.content.remove(&CacheId::derive("http://a")));
    let degraded = h.cache.get(&lookup("http://a"), "http://a").await.expect("degraded hit");
    assert_eq!(degraded.source, HitSource::Degraded);

    assert_eq!(primary_hash, ContentDigest::of(&payload));
    assert_eq!(degraded.content_hash, primary_hash);
}

#[tokio::test]
async fn missing_blob_falls_back_to_last_good() {
    let h = harness();
    let payload = Bytes::from_static(b"<html>fallback</html>");

    h.cache
        .set(&rendered("http://a", 200), "http://a", payload.clone())
        .await;
    assert!(h.content.remove(&CacheId::derive("http://a")));

    let hit = h.cache.get(&lookup("http://a"), "http://a").await.expect("degraded hit");
    assert_eq!(hit.source, HitSource::Degraded);
    assert_eq!(hit.status_code, 200);
    assert_eq!(hit.content_type, "text/html");
    assert_eq!(hit.into_bytes().await.expect("body"), payload);
}

#[tokio::test]
async fn binary_payload_survives_the_degraded_path() {
    let h = harness();
    let payload = Bytes::from(vec![0x89, b'P', b'N', b'G', 0xff, 0x00, 0xfe]);
    let mut ctx = rendered("http://a/logo.png", 200);
    ctx.content_type = Some("image/png".to_string());

    h.cache.set(&ctx, "http://a/logo.png", payload.clone()).await;
    h.content.remove(&CacheId::derive("http://a/logo.png"));

    let hit = h
        .cache
        .get(&lookup("http://a/logo.png"), "http://a/logo.png")
        .await
        .expect("degraded hit");
    assert_eq!(hit.content_type, "image/png");
    assert_eq!(hit.into_bytes().await.expect("body"), payload);
}

#[tokio::test]
async fn non_success_renders_never_touch_last_good() {
    let h = harness();

    for status in [404, 500, 301] {
        h.cache
            .set(&rendered("http://b", status), "http://b", Bytes::from_static(b"nope"))
            .await;
    }

    assert!(h.content.is_empty());
    assert!(h.cache.get(&lookup("http://b"), "http://b").await.is_none());

    let record = h
        .ledger
        .find_record("http://b")
        .await
        .expect("ledger")
        .expect("record");
    assert_eq!(record.last_good, None);
    let statuses: Vec<u16> = record.history.iter().map(|event| event.status_code).collect();
    assert_eq!(statuses, vec![404, 500, 301]);
}

#[tokio::test]
async fn history_grows_in_call_order() {
    let h = harness();
    let mut previous_len = 0;

    for (n, status) in [200, 503, 200, 404].into_iter().enumerate() {
        h.cache
            .set(
                &rendered("http://c", status),
                "http://c",
                Bytes::from(format!("body {n}")),
            )
            .await;

        let record = h
            .ledger
            .find_record("http://c")
            .await
            .expect("ledger")
            .expect("record");
        assert_eq!(record.history.len(), previous_len + 1);
        assert!(record.created <= record.updated);
        previous_len = record.history.len();
    }

    let record = h
        .ledger
        .find_record("http://c")
        .await
        .expect("ledger")
        .expect("record");
    let statuses: Vec<u16> = record.history.iter().map(|event| event.status_code).collect();
    assert_eq!(statuses, vec![200, 503, 200, 404]);
    assert!(
        record
            .history
            .windows(2)
            .all(|pair| pair[0].recorded_at <= pair[1].recorded_at)
    );
    assert_eq!(
        record.last_good.expect("last good").value,
        InlineValue::Text("body 2".to_string())
    );
}

#[tokio::test]
async fn expired_records_are_not_served() {
    let h = harness_with_retention(RetentionPolicy::new(Duration::from_secs(3600)));

    h.cache
        .set(&rendered("http://d", 200), "http://d", Bytes::from_static(b"stale"))
        .await;
    h.content.remove(&CacheId::derive("http://d"));
    h.ledger
        .set_updated(&CacheId::derive("http://d"), datetime!(2001-01-01 0:00 UTC));

    assert_eq!(
        h.ledger.fetch_fallback("http://d").await.expect("ledger"),
        None
    );
    assert!(h.cache.get(&lookup("http://d"), "http://d").await.is_none());
}

#[tokio::test]
async fn content_outage_degrades_to_ledger() {
    let h = harness();
    h.cache
        .set(&rendered("http://e", 200), "http://e", Bytes::from_static(b"kept"))
        .await;

    h.content.set_unavailable(true);
    let hit = h.cache.get(&lookup("http://e"), "http://e").await.expect("degraded hit");
    assert_eq!(hit.source, HitSource::Degraded);
    assert_eq!(hit.into_bytes().await.expect("body"), "kept");

    h.ledger.set_unavailable(true);
    assert!(h.cache.get(&lookup("http://e"), "http://e").await.is_none());
}

#[tokio::test]
async fn ledger_outage_does_not_block_the_blob_write() {
    let h = harness();
    h.ledger.set_unavailable(true);

    h.cache
        .set(&rendered("http://f", 200), "http://f", Bytes::from_static(b"blob only"))
        .await;

    let hit = h.cache.get(&lookup("http://f"), "http://f").await.expect("hit");
    assert_eq!(hit.source, HitSource::Primary);
    assert_eq!(hit.into_bytes().await.expect("body"), "blob only");
}

#[tokio::test]
async fn request_metadata_lands_in_history() {
    let h = harness();
    let mut ctx = rendered("http://g", 200);
    ctx.headers
        .insert("x-forwarded-for", "198.51.100.4, 10.0.0.1".parse().expect("header"));
    ctx.headers
        .insert("user-agent", "Googlebot/2.1".parse().expect("header"));
    ctx.download_started = Some(datetime!(2024-05-01 10:00:00 UTC));
    ctx.download_finished = Some(datetime!(2024-05-01 10:00:00.420 UTC));

    h.cache.set(&ctx, "http://g", Bytes::from_static(b"meta")).await;

    let record = h
        .ledger
        .find_record("http://g")
        .await
        .expect("ledger")
        .expect("record");
    let event = &record.history[0];
    assert_eq!(event.key, "http://g");
    assert_eq!(event.client_ip.as_deref(), Some("198.51.100.4"));
    assert_eq!(event.user_agent.as_deref(), Some("Googlebot/2.1"));
    assert_eq!(event.execution_time_ms, Some(420));
    assert_eq!(event.occurred_at, ctx.start);
    assert_eq!(event.content_type, "text/html");
}

#[tokio::test]
async fn missing_content_type_uses_the_configured_default() {
    let h = harness();
    let mut ctx = rendered("http://h", 200);
    ctx.content_type = None;

    h.cache.set(&ctx, "http://h", Bytes::from_static(b"untyped")).await;

    let hit = h.cache.get(&lookup("http://h"), "http://h").await.expect("hit");
    assert_eq!(hit.content_type, CacheConfig::default().default_content_type);
}
