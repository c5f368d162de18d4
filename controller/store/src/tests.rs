use super::*;
use maplit::btreemap;
use report_cache_controller_core::{
    CacheService, CacheUpdater, CacheValue, ClusterRecord, CounterPair, NamespaceRecord,
    ReportDetail, ReportKey, ReportMeta, ReportSummary,
};
use serde_json::json;
use std::{path::Path, sync::Arc, time::Duration};

const KIND: &str = "vulnerabilityreports";

fn mk_cache(path: Option<&Path>) -> ReportCache {
    let config = StoreConfig {
        path: path.map(|p| p.join("cache.json")),
        ..Default::default()
    };
    ReportCache::new(
        Arc::new(CacheStore::new(config, CacheMetrics::default())),
        Arc::new(CounterRegistry::default()),
    )
}

fn mk_summary(cluster: &str, ns: &str, name: &str, critical: u64) -> ReportSummary {
    let key = ReportKey::new(cluster, ns, KIND, name);
    let meta = ReportMeta {
        uid: Some(format!("uid-{name}")),
        labels: btreemap! {
            "trivy-operator.resource.kind".to_string() => "ReplicaSet".to_string(),
        },
        ..Default::default()
    };
    let body = json!({
        "report": {
            "artifact": {"repository": "library/nginx", "tag": "1.25"},
            "summary": {"criticalCount": critical, "highCount": 0},
            "vulnerabilities": [],
        }
    });
    ReportSummary::project(&key, meta, &body)
}

fn pair(total: u64, with_vulnerabilities: u64) -> Option<CounterPair> {
    Some(CounterPair {
        total,
        with_vulnerabilities,
    })
}

#[test]
fn set_then_delete_report() {
    let cache = mk_cache(None);
    let key = "report:c1:ns1:vulnerabilityreports:r1";
    cache.set(key, CacheValue::Json(json!({"critical": 2})), None);
    assert!(cache.get(key).is_some());
    assert!(cache.items_by_type(KIND).contains_key(key));

    cache.delete(key);
    assert_eq!(cache.get(key), None);
    assert!(!cache.items_by_type(KIND).contains_key(key));
    assert!(cache.store().keys_for_cluster("c1").is_empty());
    assert_eq!(cache.get_counts("c1", KIND), pair(0, 0));
}

#[test]
fn set_report_counts_vulnerable_reports() {
    let cache = mk_cache(None);
    cache.set(
        "report:c1:ns1:vulnerabilityreports:r1",
        CacheValue::Json(json!({"critical": 2})),
        None,
    );
    assert_eq!(cache.get_counts("c1", KIND), pair(1, 1));
    assert_eq!(cache.get_counts_by_namespace("c1", "ns1", KIND), pair(1, 1));
}

#[test]
fn malformed_report_keys_are_rejected() {
    let cache = mk_cache(None);
    cache.set("report:c1:ns1", CacheValue::Json(json!({"critical": 2})), None);
    cache.set("detail:c1", CacheValue::Json(json!({})), None);
    assert_eq!(cache.get("report:c1:ns1"), None);
    assert_eq!(cache.get("detail:c1"), None);
    assert!(cache.items().is_empty());

    cache.set("settings", CacheValue::Json(json!({"theme": "dark"})), None);
    assert!(cache.get("settings").is_some());
}

#[test]
fn resetting_a_report_overwrites_in_place() {
    let cache = mk_cache(None);
    assert_eq!(cache.set_report(mk_summary("c1", "ns1", "r1", 0)), None);
    assert_eq!(cache.set_report(mk_summary("c1", "ns1", "r1", 4)), Some(false));
    assert_eq!(cache.items_by_type(KIND).len(), 1);
    assert_eq!(cache.store().keys_for_cluster("c1").len(), 1);

    let value = cache.get("report:c1:ns1:vulnerabilityreports:r1").unwrap();
    assert_eq!(value.as_report().unwrap().severity.critical, 4);
}

#[test]
fn generic_set_counts_like_watch_updates() {
    let cache = mk_cache(None);
    let key = "report:c1:ns1:vulnerabilityreports:r1";
    cache.set(key, CacheValue::Report(mk_summary("c1", "ns1", "r1", 0)), None);
    cache.set(key, CacheValue::Report(mk_summary("c1", "ns1", "r1", 0)), None);
    assert_eq!(cache.get_counts("c1", KIND), pair(1, 0));

    cache.set(key, CacheValue::Report(mk_summary("c1", "ns1", "r1", 3)), None);
    assert_eq!(cache.get_counts("c1", KIND), pair(1, 1));
}

#[test]
fn deleting_a_report_drops_its_detail() {
    let cache = mk_cache(None);
    let summary = mk_summary("c1", "ns1", "r1", 1);
    let key = summary.key();
    cache.apply_report(summary);
    cache.set(
        &key.detail_key(),
        CacheValue::Detail(ReportDetail::new(&key, json!({"report": {}}))),
        None,
    );

    assert!(cache.remove_report(&key));
    assert_eq!(cache.get(&key.detail_key()), None);
    assert_eq!(cache.get_counts("c1", KIND), pair(0, 0));
}

#[test]
fn metadata_expires_but_reports_do_not() {
    let cache = mk_cache(None);
    cache.set(
        "namespace:c1:ns1",
        CacheValue::Namespace(NamespaceRecord {
            cluster: "c1".into(),
            name: "ns1".into(),
        }),
        Some(Duration::ZERO),
    );
    cache.set(
        "report:c1:ns1:vulnerabilityreports:r1",
        CacheValue::Report(mk_summary("c1", "ns1", "r1", 0)),
        Some(Duration::ZERO),
    );

    assert_eq!(cache.get("namespace:c1:ns1"), None);
    assert!(cache.get("report:c1:ns1:vulnerabilityreports:r1").is_some());
    assert_eq!(cache.store().purge_expired(), 0);
    assert_eq!(cache.items().len(), 1);
}

#[test]
fn unrepresentable_ttls_never_expire() {
    let cache = mk_cache(None);
    let ttl = Duration::from_secs(10u64.pow(13));
    cache.set("cluster:c1", CacheValue::Json(json!({})), Some(ttl));
    let entry = cache
        .store()
        .get_entry("cluster:c1")
        .expect("entry must be stored");
    assert_eq!(entry.expires_at, None);
    assert_eq!(cache.get("cluster:c1"), Some(CacheValue::Json(json!({}))));

    cache.set("cluster:c2", CacheValue::Json(json!({})), Some(Duration::MAX));
    assert!(cache.get("cluster:c2").is_some());
}

#[test]
fn load_with_unrepresentable_report_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        path: Some(dir.path().join("cache.json")),
        report_ttl: Duration::from_secs(10u64.pow(13)),
        ..Default::default()
    };
    let cache = ReportCache::new(
        Arc::new(CacheStore::new(config, CacheMetrics::default())),
        Arc::new(CounterRegistry::default()),
    );
    cache.apply_report(mk_summary("c1", "ns1", "r1", 1));
    cache.save().unwrap();

    let loaded = cache.load().unwrap();
    assert_eq!(loaded.reports, 1);
    let entry = cache
        .store()
        .get_entry("report:c1:ns1:vulnerabilityreports:r1")
        .expect("report must be retained");
    assert_eq!(entry.expires_at, None);
    assert_eq!(cache.get_counts("c1", KIND), pair(1, 1));
}

#[test]
fn entries_gauge_follows_writes_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let cache = mk_cache(Some(dir.path()));
    let metrics = cache.store().metrics().clone();

    cache.set("cluster:c1", CacheValue::Json(json!({})), None);
    cache.apply_report(mk_summary("c1", "ns1", "r1", 1));
    cache.apply_report(mk_summary("c1", "ns1", "r1", 2));
    cache.apply_report(mk_summary("c1", "ns1", "r2", 0));
    assert_eq!(metrics.entries("cluster"), 1);
    assert_eq!(metrics.entries("report"), 2);

    cache.delete("report:c1:ns1:vulnerabilityreports:r1");
    assert_eq!(metrics.entries("report"), 1);
    cache.save().unwrap();

    cache.delete("cluster:c1");
    cache.apply_report(mk_summary("c1", "ns1", "r3", 0));
    cache.load().unwrap();
    assert_eq!(metrics.entries("cluster"), 1);
    assert_eq!(metrics.entries("report"), 1);
}

#[test]
fn size_eviction_spares_reports() {
    let config = StoreConfig {
        max_cost: 4 * 1024,
        ..Default::default()
    };
    let store = CacheStore::new(config, CacheMetrics::default());
    let report = mk_summary("c1", "ns1", "r1", 1);
    let report_key = report.key().report_key();
    store.set(&report_key, CacheValue::Report(report), None);

    for i in 0..500 {
        store.set(
            &format!("namespace:c1:ns-{i}"),
            CacheValue::Namespace(NamespaceRecord {
                cluster: "c1".into(),
                name: format!("ns-{i}"),
            }),
            None,
        );
    }
    for _ in 0..8 {
        store.run_pending_tasks();
    }

    let stats = store.stats();
    assert!(stats.evictions > 0, "expected evictions: {stats:?}");
    // Evicted metadata is purged from the authoritative map as well.
    assert!(stats.namespaces < 500, "expected purged namespaces: {stats:?}");
    assert_eq!(stats.reports, 1);
    assert!(store.get(&report_key).is_some());
}

#[test]
fn indexes_reports_by_cluster() {
    let cache = mk_cache(None);
    cache.apply_report(mk_summary("c1", "ns1", "r1", 0));
    cache.apply_report(mk_summary("c1", "ns2", "r2", 0));
    cache.apply_report(mk_summary("c2", "ns1", "r1", 0));
    cache.set(
        "cluster:c3",
        CacheValue::Cluster(ClusterRecord {
            name: "c3".into(),
            ..Default::default()
        }),
        None,
    );

    let mut clusters = cache.store().clusters_with_reports();
    clusters.sort();
    assert_eq!(clusters, vec!["c1".to_string(), "c2".to_string()]);

    let mut keys = cache.store().keys_for_cluster("c1");
    keys.sort();
    assert_eq!(
        keys,
        vec![
            ReportKey::new("c1", "ns1", KIND, "r1"),
            ReportKey::new("c1", "ns2", KIND, "r2"),
        ]
    );

    assert_eq!(cache.remove_cluster("c1"), 2);
    assert!(cache.store().keys_for_cluster("c1").is_empty());
    assert_eq!(cache.get_counts("c1", KIND), None);
    assert_eq!(cache.get_counts("c2", KIND), pair(1, 0));

    let stats = cache.stats();
    assert_eq!(stats.reports, 1);
    assert_eq!(stats.clusters, 1);
}

#[test]
fn indexes_details_by_cluster() {
    let cache = mk_cache(None);
    let orphan = ReportKey::new("c4", "ns1", KIND, "gone");
    cache.set(
        &orphan.detail_key(),
        CacheValue::Detail(ReportDetail::new(&orphan, json!({"report": {}}))),
        None,
    );

    assert_eq!(cache.store().clusters_with_reports(), vec!["c4".to_string()]);
    assert!(cache.store().keys_for_cluster("c4").is_empty());
    assert_eq!(cache.store().detail_keys_for_cluster("c4"), vec![orphan.clone()]);
    assert!(cache.store().contains_key(&orphan.detail_key()));

    assert_eq!(cache.remove_cluster("c4"), 0);
    assert_eq!(cache.get(&orphan.detail_key()), None);
    assert!(cache.store().detail_keys_for_cluster("c4").is_empty());
    assert!(cache.store().clusters_with_reports().is_empty());
}

#[test]
fn save_then_load_reproduces_reports() {
    let dir = tempfile::tempdir().unwrap();
    let cache = mk_cache(Some(dir.path()));
    cache.apply_report(mk_summary("c1", "ns1", "r1", 2));
    cache.apply_report(mk_summary("c1", "ns1", "r2", 0));
    cache.set(
        "report:c1::clusterrbacassessmentreports:admin",
        CacheValue::Json(json!({"summary": {"highCount": 1}})),
        None,
    );
    let before = cache.items();

    let saved = cache.save().unwrap();
    assert_eq!(saved.saved, 3);
    assert!(cache.stats().last_saved.is_some());

    let restored = mk_cache(Some(dir.path()));
    let loaded = restored.load().unwrap();
    assert_eq!(loaded.loaded, 3);
    assert_eq!(loaded.reports, 3);
    assert!(!loaded.corrupt);
    assert_eq!(restored.items(), before);
    assert_eq!(restored.get_counts("c1", KIND), pair(2, 1));
    assert_eq!(
        restored.get_counts("c1", "clusterrbacassessmentreports"),
        pair(1, 1)
    );
}

#[test]
fn load_drops_expired_metadata_and_renews_reports() {
    let dir = tempfile::tempdir().unwrap();
    let report = mk_summary("c1", "ns1", "r1", 2);
    let file = json!({
        "namespace:c1:ns1": {
            "value": {"type": "namespace", "data": {"cluster": "c1", "name": "ns1"}},
            "expiration": "2020-01-01T00:00:00Z",
            "updatedAt": "2019-12-31T23:55:00Z",
        },
        "report:c1:ns1:vulnerabilityreports:r1": {
            "value": CacheValue::Report(report),
            "expiration": "2020-01-02T00:00:00Z",
            "updatedAt": "2020-01-01T00:00:00Z",
        },
    });
    std::fs::write(
        dir.path().join("cache.json"),
        serde_json::to_vec(&file).unwrap(),
    )
    .unwrap();

    let cache = mk_cache(Some(dir.path()));
    let loaded = cache.load().unwrap();
    assert_eq!(loaded.expired, 1);
    assert_eq!(loaded.loaded, 1);

    assert_eq!(cache.get("namespace:c1:ns1"), None);
    let entry = cache
        .store()
        .get_entry("report:c1:ns1:vulnerabilityreports:r1")
        .expect("report must be retained");
    assert!(entry.expires_at.unwrap() > chrono::Utc::now());
    assert_eq!(cache.get_counts("c1", KIND), pair(1, 1));
}

#[test]
fn corrupt_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("cache.json"), b"{\"report:c1").unwrap();

    let cache = mk_cache(Some(dir.path()));
    cache.apply_report(mk_summary("c1", "ns1", "r1", 0));
    let loaded = cache.load().unwrap();
    assert!(loaded.corrupt);
    assert!(cache.items().is_empty());
    assert_eq!(cache.get_counts("c1", KIND), None);
}

#[test]
fn missing_snapshot_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let cache = mk_cache(Some(dir.path()));
    assert_eq!(cache.load().unwrap(), LoadSummary::default());
}

#[test]
fn malformed_entries_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let file = json!({
        "cluster:c1": {"expiration": null},
        "report:c1:ns1:vulnerabilityreports:r1": {"value": {"critical": 1}},
    });
    std::fs::write(
        dir.path().join("cache.json"),
        serde_json::to_vec(&file).unwrap(),
    )
    .unwrap();

    let cache = mk_cache(Some(dir.path()));
    let loaded = cache.load().unwrap();
    assert_eq!(loaded.invalid, 1);
    assert_eq!(
        cache.get("report:c1:ns1:vulnerabilityreports:r1"),
        Some(CacheValue::Json(json!({"critical": 1})))
    );
    assert_eq!(cache.get_counts("c1", KIND), pair(1, 1));
}

#[test]
fn save_without_path_fails() {
    let cache = mk_cache(None);
    assert!(matches!(cache.save(), Err(PersistError::NoPath)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_keep_counts_consistent() {
    let cache = mk_cache(None);
    let tasks = (0..8)
        .map(|t| {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    cache.apply_report(mk_summary("c1", "ns1", &format!("r{}", i % 50), t % 2));
                }
            })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await.unwrap();
    }

    let counts = cache.get_counts("c1", KIND).unwrap();
    assert_eq!(counts.total, 50);
    assert_eq!(cache.items_by_type(KIND).len(), 50);

    // Concurrent flips may leave the vulnerability count transiently off;
    // a rebuild always matches the cache.
    cache.rebuild_counters();
    let vulnerable = cache
        .items_by_type(KIND)
        .values()
        .filter(|v| v.has_vulnerabilities())
        .count() as u64;
    assert_eq!(cache.get_counts("c1", KIND), pair(50, vulnerable));
}
