use std::collections::HashSet;
use std::sync::Arc;

use axum::http::Method;
use bytes::Bytes;
use metrics_util::debugging::DebuggingRecorder;
use renderstash::application::request::RequestContext;
use renderstash::cache::{CacheConfig, CacheId, CacheOrchestrator, StoreContext};
use renderstash::infra::memory::{MemoryContentStore, MemoryLedger};
use renderstash::infra::telemetry;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let content = Arc::new(MemoryContentStore::new());
    let ledger = Arc::new(MemoryLedger::default());
    let cache = CacheOrchestrator::new(
        StoreContext::new(content.clone(), ledger.clone()),
        CacheConfig::default(),
    );
    let lookup = RequestContext::new("http://m", Method::GET);

    // miss, then a stored render, then a primary hit
    assert!(cache.get(&lookup, "http://m").await.is_none());
    cache
        .set(&RequestContext::new("http://m", Method::GET), "http://m", Bytes::from_static(b"m"))
        .await;
    assert!(cache.get(&lookup, "http://m").await.is_some());

    // degraded hit after the blob disappears
    content.remove(&CacheId::derive("http://m"));
    assert!(cache.get(&lookup, "http://m").await.is_some());

    // both stores failing
    content.set_unavailable(true);
    ledger.set_unavailable(true);
    assert!(cache.get(&lookup, "http://m").await.is_none());

    let entries: Vec<(String, Vec<(String, String)>)> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| {
            let key = composite_key.key();
            let labels = key
                .labels()
                .map(|label| (label.key().to_string(), label.value().to_string()))
                .collect();
            (key.name().to_string(), labels)
        })
        .collect();

    let names: HashSet<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
    for metric in [
        "renderstash_get_total",
        "renderstash_store_failure_total",
        "renderstash_blob_write_ms",
    ] {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let outcomes: HashSet<&str> = entries
        .iter()
        .filter(|(name, _)| name == "renderstash_get_total")
        .flat_map(|(_, labels)| labels.iter())
        .filter(|(key, _)| key == "outcome")
        .map(|(_, value)| value.as_str())
        .collect();
    assert_eq!(outcomes, HashSet::from(["hit", "degraded", "miss"]));

    let failed_stores: HashSet<&str> = entries
        .iter()
        .filter(|(name, _)| name == "renderstash_store_failure_total")
        .flat_map(|(_, labels)| labels.iter())
        .filter(|(key, _)| key == "store")
        .map(|(_, value)| value.as_str())
        .collect();
    assert!(failed_stores.contains("memory-content"));
    assert!(failed_stores.contains("memory-ledger"));
}
