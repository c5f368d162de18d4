use crate::metrics::SyncMetrics;
use ahash::AHashMap as HashMap;
use futures::prelude::*;
use parking_lot::RwLock;
use report_cache_controller_core::{CacheUpdater, ReportKey};
use report_cache_controller_store::ReportCache;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time;
use tracing::{debug, info};

/// Whether a watch mirror holds a report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    /// The kind has no mirror, or its mirror has not synced.
    Unknown,
}

/// A read-only view of a cluster's watched reports.
pub trait Mirror: Send + Sync {
    fn lookup(&self, key: &ReportKey) -> Presence;
}

/// The mirrors of every cluster with running watches.
#[derive(Clone, Default)]
pub struct MirrorSet(Arc<RwLock<HashMap<String, Arc<dyn Mirror>>>>);

#[derive(Clone, Debug)]
pub struct SweepConfig {
    pub batch_size: usize,
    pub max_concurrent_clusters: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub clusters: usize,
    pub checked: usize,
    pub removed: usize,
    pub cancelled: bool,
}

/// Removes cached reports that are no longer present in their cluster.
///
/// Watches may miss deletions while disconnected; the sweeper cross-checks the
/// cached report keys against the watch mirrors and deletes the strays. Cached
/// details whose report summary is gone are removed as well.
#[derive(Clone)]
pub struct ReconciliationSweeper {
    cache: ReportCache,
    mirrors: MirrorSet,
    config: SweepConfig,
    metrics: SyncMetrics,
}

#[derive(Debug, Default)]
struct Progress {
    clusters: AtomicUsize,
    checked: AtomicUsize,
    removed: AtomicUsize,
}

// === impl MirrorSet ===

impl MirrorSet {
    pub fn insert(&self, cluster: impl Into<String>, mirror: Arc<dyn Mirror>) {
        self.0.write().insert(cluster.into(), mirror);
    }

    pub fn remove(&self, cluster: &str) -> Option<Arc<dyn Mirror>> {
        self.0.write().remove(cluster)
    }

    pub fn get(&self, cluster: &str) -> Option<Arc<dyn Mirror>> {
        self.0.read().get(cluster).cloned()
    }
}

impl std::fmt::Debug for MirrorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let clusters = self.0.read().keys().cloned().collect::<Vec<_>>();
        f.debug_tuple("MirrorSet").field(&clusters).finish()
    }
}

// === impl SweepConfig ===

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_concurrent_clusters: 3,
        }
    }
}

// === impl ReconciliationSweeper ===

impl ReconciliationSweeper {
    pub fn new(
        cache: ReportCache,
        mirrors: MirrorSet,
        config: SweepConfig,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            cache,
            mirrors,
            config,
            metrics,
        }
    }

    /// Sweeps every `interval` until shutdown.
    pub async fn run(self, interval: Duration, shutdown: drain::Watch) {
        let mut ticks = time::interval_at(time::Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                release = shutdown.clone().signaled() => {
                    drop(release);
                    debug!("Reconciliation stopped");
                    return;
                }
                _ = ticks.tick() => {}
            }

            let summary = self.sweep(shutdown.clone()).await;
            if summary.removed > 0 {
                info!(
                    clusters = summary.clusters,
                    checked = summary.checked,
                    removed = summary.removed,
                    "Removed stale reports"
                );
            } else {
                debug!(
                    clusters = summary.clusters,
                    checked = summary.checked,
                    "Reconciled reports"
                );
            }
            if summary.cancelled {
                return;
            }
        }
    }

    /// Runs a single sweep across all clusters with cached reports.
    ///
    /// The sweep stops early when `shutdown` is signaled; work done before
    /// that point is kept and reported.
    pub async fn sweep(&self, shutdown: drain::Watch) -> SweepSummary {
        let progress = Progress::default();
        let clusters = self.cache.store().clusters_with_reports();
        let work = stream::iter(clusters)
            .map(|cluster| self.sweep_cluster(cluster, &progress))
            .buffer_unordered(self.config.max_concurrent_clusters.max(1))
            .for_each(|()| future::ready(()));

        let cancelled = tokio::select! {
            biased;
            release = shutdown.signaled() => {
                drop(release);
                true
            }
            () = work => false,
        };
        if cancelled {
            debug!("Reconciliation cancelled");
        }
        progress.summary(cancelled)
    }

    async fn sweep_cluster(&self, cluster: String, progress: &Progress) {
        let Some(mirror) = self.mirrors.get(&cluster) else {
            debug!(%cluster, "Skipping cluster without watches");
            return;
        };
        progress.clusters.fetch_add(1, Ordering::Relaxed);

        let keys = self.cache.store().keys_for_cluster(&cluster);
        let mut removed = 0;
        for batch in keys.chunks(self.config.batch_size.max(1)) {
            for key in batch {
                match mirror.lookup(key) {
                    Presence::Present => {}
                    Presence::Unknown => continue,
                    Presence::Absent => {
                        if self.cache.remove_report(key) {
                            debug!(%key, "Removed report missing from cluster");
                            progress.removed.fetch_add(1, Ordering::Relaxed);
                            removed += 1;
                        }
                    }
                }
                progress.checked.fetch_add(1, Ordering::Relaxed);
            }
            // Cancellation is observed between batches.
            tokio::task::yield_now().await;
        }

        // Details are dropped with their reports, but a refresh that completes
        // after its report was deleted leaves a detail without a summary.
        let details = self.cache.store().detail_keys_for_cluster(&cluster);
        for batch in details.chunks(self.config.batch_size.max(1)) {
            for key in batch {
                if self.cache.store().contains_key(&key.report_key()) {
                    continue;
                }
                if mirror.lookup(key) != Presence::Present
                    && self.cache.store().delete(&key.detail_key()).is_some()
                {
                    debug!(%key, "Removed detail of an uncached report");
                    progress.removed.fetch_add(1, Ordering::Relaxed);
                    removed += 1;
                }
                progress.checked.fetch_add(1, Ordering::Relaxed);
            }
            tokio::task::yield_now().await;
        }

        self.metrics.swept(&cluster, removed);
    }
}

impl std::fmt::Debug for ReconciliationSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationSweeper")
            .field("mirrors", &self.mirrors)
            .field("config", &self.config)
            .finish()
    }
}

// === impl Progress ===

impl Progress {
    fn summary(&self, cancelled: bool) -> SweepSummary {
        SweepSummary {
            clusters: self.clusters.load(Ordering::Relaxed),
            checked: self.checked.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            cancelled,
        }
    }
}

