use super::*;
use crate::{
    Mirror, MirrorSet, Presence, ReconciliationSweeper, ReportHandler, SweepConfig, SweepSummary,
    SyncMetrics,
};
use report_cache_controller_core::{CacheService, CacheValue, ReportDetail, ReportKey};
use std::collections::HashSet;

/// A mirror holding a fixed set of reports. Kinds outside `synced` have not
/// synced.
#[derive(Default)]
struct FakeMirror {
    synced: HashSet<String>,
    present: HashSet<ReportKey>,
}

impl Mirror for FakeMirror {
    fn lookup(&self, key: &ReportKey) -> Presence {
        if !self.synced.contains(&key.kind) {
            return Presence::Unknown;
        }
        if self.present.contains(key) {
            Presence::Present
        } else {
            Presence::Absent
        }
    }
}

fn mk_sweeper(
    cache: &ReportCache,
    mirrors: &MirrorSet,
    batch_size: usize,
) -> ReconciliationSweeper {
    ReconciliationSweeper::new(
        cache.clone(),
        mirrors.clone(),
        SweepConfig {
            batch_size,
            ..Default::default()
        },
        SyncMetrics::default(),
    )
}

#[tokio::test]
async fn sweep_removes_reports_missing_from_mirror() {
    let cache = mk_cache();
    let handler = ReportHandler::new("c1", Arc::new(cache.clone()));
    handler.apply(&vuln_kind(), &mk_report("ns1", "kept", 1));
    handler.apply(&vuln_kind(), &mk_report("ns1", "gone", 1));
    assert_eq!(cache.get_counts("c1", KIND).unwrap().total, 2);

    let mirrors = MirrorSet::default();
    mirrors.insert(
        "c1",
        Arc::new(FakeMirror {
            synced: [KIND.to_string()].into_iter().collect(),
            present: [ReportKey::new("c1", "ns1", KIND, "kept")]
                .into_iter()
                .collect(),
        }),
    );

    let (_signal, shutdown) = drain::channel();
    let summary = mk_sweeper(&cache, &mirrors, 100).sweep(shutdown).await;
    assert_eq!(
        summary,
        SweepSummary {
            clusters: 1,
            checked: 2,
            removed: 1,
            cancelled: false,
        }
    );

    assert!(cache.get("report:c1:ns1:vulnerabilityreports:kept").is_some());
    assert!(cache.get("report:c1:ns1:vulnerabilityreports:gone").is_none());
    let counts = cache.get_counts("c1", KIND).unwrap();
    assert_eq!((counts.total, counts.with_vulnerabilities), (1, 1));
}

#[tokio::test]
async fn sweep_removes_details_left_behind_by_deleted_reports() {
    let cache = mk_cache();
    let handler = ReportHandler::new("c1", Arc::new(cache.clone()));
    let kept = ReportKey::new("c1", "ns1", KIND, "kept");
    let gone = ReportKey::new("c1", "ns1", KIND, "gone");
    handler.apply(&vuln_kind(), &mk_report("ns1", "kept", 1));
    handler.apply(&vuln_kind(), &mk_report("ns1", "gone", 1));
    cache.set(
        &kept.detail_key(),
        CacheValue::Detail(ReportDetail::new(&kept, json!({"report": {}}))),
        None,
    );

    // A refresh that completes after the delete event writes a detail whose
    // summary is already gone.
    assert!(handler.delete(&vuln_kind(), &mk_report("ns1", "gone", 1)));
    cache.set(
        &gone.detail_key(),
        CacheValue::Detail(ReportDetail::new(&gone, json!({"report": {}}))),
        None,
    );

    let mirrors = MirrorSet::default();
    mirrors.insert(
        "c1",
        Arc::new(FakeMirror {
            synced: [KIND.to_string()].into_iter().collect(),
            present: [kept.clone()].into_iter().collect(),
        }),
    );

    let (_signal, shutdown) = drain::channel();
    let summary = mk_sweeper(&cache, &mirrors, 100).sweep(shutdown).await;
    assert_eq!(
        summary,
        SweepSummary {
            clusters: 1,
            checked: 2,
            removed: 1,
            cancelled: false,
        }
    );
    assert!(cache.get(&gone.detail_key()).is_none());
    assert!(cache.get(&kept.detail_key()).is_some());
    assert_eq!(cache.store().detail_keys_for_cluster("c1"), vec![kept]);
    let counts = cache.get_counts("c1", KIND).unwrap();
    assert_eq!((counts.total, counts.with_vulnerabilities), (1, 1));
}

#[tokio::test]
async fn sweep_skips_unsynced_kinds_and_unwatched_clusters() {
    let cache = mk_cache();
    let c1 = ReportHandler::new("c1", Arc::new(cache.clone()));
    let c2 = ReportHandler::new("c2", Arc::new(cache.clone()));
    for i in 0..250 {
        c1.apply(&vuln_kind(), &mk_report("ns1", &format!("r{i}"), 0));
    }
    c2.apply(&vuln_kind(), &mk_report("ns1", "r0", 0));

    // c1's mirror has not synced the kind; c2 has no mirror at all.
    let mirrors = MirrorSet::default();
    mirrors.insert("c1", Arc::new(FakeMirror::default()));

    let (_signal, shutdown) = drain::channel();
    let summary = mk_sweeper(&cache, &mirrors, 100).sweep(shutdown).await;
    assert_eq!(summary.clusters, 1);
    assert_eq!(summary.checked, 0);
    assert_eq!(summary.removed, 0);
    assert_eq!(cache.items_by_type(KIND).len(), 251);
}

#[tokio::test]
async fn sweep_processes_every_batch() {
    let cache = mk_cache();
    let handler = ReportHandler::new("c1", Arc::new(cache.clone()));
    for i in 0..25 {
        handler.apply(&vuln_kind(), &mk_report("ns1", &format!("r{i}"), 0));
    }

    let mirrors = MirrorSet::default();
    mirrors.insert(
        "c1",
        Arc::new(FakeMirror {
            synced: [KIND.to_string()].into_iter().collect(),
            present: HashSet::new(),
        }),
    );

    let (_signal, shutdown) = drain::channel();
    let summary = mk_sweeper(&cache, &mirrors, 10).sweep(shutdown).await;
    assert_eq!(summary.removed, 25);
    assert!(cache.items_by_type(KIND).is_empty());
    assert_eq!(cache.get_counts("c1", KIND).unwrap().total, 0);
}

#[tokio::test]
async fn sweep_stops_on_shutdown() {
    let cache = mk_cache();
    let handler = ReportHandler::new("c1", Arc::new(cache.clone()));
    handler.apply(&vuln_kind(), &mk_report("ns1", "r1", 0));

    let mirrors = MirrorSet::default();
    mirrors.insert(
        "c1",
        Arc::new(FakeMirror {
            synced: [KIND.to_string()].into_iter().collect(),
            present: HashSet::new(),
        }),
    );

    let (signal, shutdown) = drain::channel();
    let drained = tokio::spawn(signal.drain());
    // Let the drain task signal shutdown.
    tokio::task::yield_now().await;

    let summary = mk_sweeper(&cache, &mirrors, 100).sweep(shutdown).await;
    assert!(summary.cancelled);
    assert_eq!(summary.removed, 0);
    assert!(cache.get("report:c1:ns1:vulnerabilityreports:r1").is_some());
    drained.await.expect("drain must complete");
}
