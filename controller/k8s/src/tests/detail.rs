use super::*;
use crate::{
    detail::jittered_ttl, ClusterConfig, ClusterRegistry, DetailConfig, DetailRefreshCoordinator,
    RefreshOutcome, SyncMetrics,
};
use report_cache_controller_core::{CacheService, CacheValue, ReportDetail, ReportKey};
use std::time::Duration;

async fn mk_coordinator(
    cache: &ReportCache,
    cluster: Arc<FakeCluster>,
) -> Arc<DetailRefreshCoordinator> {
    let clusters = Arc::new(ClusterRegistry::new(cache.clone(), ClusterConfig::default()));
    clusters.set_cluster_client("c1", cluster).await;
    Arc::new(DetailRefreshCoordinator::new(
        cache.clone(),
        clusters,
        vec![vuln_kind()],
        DetailConfig {
            fetch_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        SyncMetrics::default(),
    ))
}

fn raw_report(name: &str) -> Value {
    json!({
        "apiVersion": "aquasecurity.github.io/v1alpha1",
        "kind": "VulnerabilityReport",
        "metadata": {"name": name, "namespace": "ns1"},
        "report": {
            "summary": {"criticalCount": 1},
            "vulnerabilities": [{"vulnerabilityID": "CVE-2024-0001"}],
        }
    })
}

#[tokio::test]
async fn concurrent_refreshes_fetch_once() {
    let cache = mk_cache();
    let cluster = Arc::new(FakeCluster::gated());
    cluster.add_report("ns1", "r1", raw_report("r1"));
    let coordinator = mk_coordinator(&cache, cluster.clone()).await;
    let key = ReportKey::new("c1", "ns1", KIND, "r1");

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        let key = key.clone();
        async move { coordinator.refresh_detail(&key).await }
    });
    cluster.gate.as_ref().unwrap().started.notified().await;
    assert!(coordinator.is_in_flight(&key));

    assert_eq!(
        coordinator.refresh_detail(&key).await,
        RefreshOutcome::InFlight
    );

    cluster.gate.as_ref().unwrap().release.notify_one();
    assert_eq!(first.await.unwrap(), RefreshOutcome::Refreshed);
    assert_eq!(cluster.fetches(), 1);
    assert!(!coordinator.is_in_flight(&key));

    let detail = cache.get(&key.detail_key()).expect("detail must be cached");
    let detail = detail.as_detail().expect("value must be a detail");
    assert_eq!(
        detail.section("vulnerabilities"),
        Some(&json!([{"vulnerabilityID": "CVE-2024-0001"}]))
    );
}

#[tokio::test]
async fn get_detail_refreshes_in_background() {
    let cache = mk_cache();
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns1"]));
    cluster.add_report("ns1", "r1", raw_report("r1"));
    let coordinator = mk_coordinator(&cache, cluster.clone()).await;
    let key = ReportKey::new("c1", "ns1", KIND, "r1");

    let lookup = coordinator.get_detail(&key);
    assert_eq!(lookup.value, None);
    assert!(!lookup.fresh);

    tokio::time::timeout(Duration::from_secs(5), async {
        while cache.get(&key.detail_key()).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("detail must be fetched");

    let lookup = coordinator.get_detail(&key);
    assert!(lookup.fresh);
    assert_eq!(lookup.value.map(|d| d.name), Some("r1".to_string()));
    assert_eq!(cluster.fetches(), 1);
}

#[tokio::test]
async fn stale_details_are_served_while_refreshing() {
    let cache = mk_cache();
    let cluster = Arc::new(FakeCluster::gated());
    cluster.add_report("ns1", "r1", raw_report("r1"));
    let coordinator = mk_coordinator(&cache, cluster.clone()).await;
    let key = ReportKey::new("c1", "ns1", KIND, "r1");

    let stale = ReportDetail::new(&key, json!({"report": {"summary": {"criticalCount": 0}}}));
    cache.set(
        &key.detail_key(),
        CacheValue::Detail(stale.clone()),
        Some(Duration::ZERO),
    );

    let lookup = coordinator.get_detail(&key);
    assert_eq!(lookup.value, Some(stale));
    assert!(!lookup.fresh);

    cluster.gate.as_ref().unwrap().started.notified().await;
    cluster.gate.as_ref().unwrap().release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), async {
        while coordinator.is_in_flight(&key) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("refresh must complete");
    assert_eq!(cluster.fetches(), 1);
}

#[tokio::test]
async fn failed_refresh_keeps_cached_detail() {
    let cache = mk_cache();
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns1"]));
    let coordinator = mk_coordinator(&cache, cluster.clone()).await;
    let key = ReportKey::new("c1", "ns1", KIND, "r1");

    let cached = ReportDetail::new(&key, raw_report("r1"));
    cache.set(
        &key.detail_key(),
        CacheValue::Detail(cached.clone()),
        Some(Duration::from_secs(60)),
    );

    cluster.fail_fetch.store(true, Ordering::SeqCst);
    assert_eq!(coordinator.refresh_detail(&key).await, RefreshOutcome::Failed);
    assert_eq!(
        cache.get(&key.detail_key()),
        Some(CacheValue::Detail(cached.clone()))
    );

    // The report no longer exists in the cluster.
    cluster.fail_fetch.store(false, Ordering::SeqCst);
    assert_eq!(
        coordinator.refresh_detail(&key).await,
        RefreshOutcome::NotFound
    );
    assert_eq!(
        cache.get(&key.detail_key()),
        Some(CacheValue::Detail(cached))
    );
    assert_eq!(cluster.fetches(), 2);
}

#[tokio::test]
async fn unknown_clusters_fail() {
    let cache = mk_cache();
    let coordinator = mk_coordinator(&cache, Arc::new(FakeCluster::default())).await;
    let key = ReportKey::new("c9", "ns1", KIND, "r1");
    assert_eq!(coordinator.refresh_detail(&key).await, RefreshOutcome::Failed);
    assert!(!coordinator.is_in_flight(&key));
}

#[test]
fn jitter_stays_in_range() {
    let ttl = Duration::from_secs(30 * 60);
    let jitter = Duration::from_secs(5 * 60);
    for _ in 0..100 {
        let jittered = jittered_ttl(ttl, jitter);
        assert!(jittered >= ttl);
        assert!(jittered < ttl + jitter);
    }
    assert_eq!(jittered_ttl(ttl, Duration::ZERO), ttl);
}
