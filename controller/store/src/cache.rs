use crate::{
    counters::{CountedReport, CounterRegistry},
    persist::{LoadSummary, PersistError, SaveSummary},
    store::CacheStore,
};
use report_cache_controller_core::{
    CacheKey, CacheService, CacheStats, CacheUpdater, CacheValue, CounterPair, ReportKey,
    ReportSummary, Snapshot,
};
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// Couples the cache store with its counters.
///
/// This is the single instance handed to the watches, the detail refresher,
/// the reconciliation sweeper and the API layer. Store and counter updates
/// for a single change are made in separate critical sections, never nested.
#[derive(Clone, Debug)]
pub struct ReportCache {
    store: Arc<CacheStore>,
    counters: Arc<CounterRegistry>,
}

// === impl ReportCache ===

impl ReportCache {
    pub fn new(store: Arc<CacheStore>, counters: Arc<CounterRegistry>) -> Self {
        Self { store, counters }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn counters(&self) -> &Arc<CounterRegistry> {
        &self.counters
    }

    pub fn get_counts(&self, cluster: &str, kind: &str) -> Option<CounterPair> {
        self.counters.get_counts(cluster, kind)
    }

    pub fn get_counts_by_namespace(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
    ) -> Option<CounterPair> {
        self.counters.get_counts_by_namespace(cluster, namespace, kind)
    }

    /// Loads the persisted snapshot and rebuilds counters from the loaded
    /// reports, so that counters always match the cache contents.
    pub fn load(&self) -> Result<LoadSummary, PersistError> {
        let summary = self.store.load_from_file()?;
        let counted = self.rebuild_counters();
        tracing::debug!(reports = counted, "Rebuilt report counters");
        Ok(summary)
    }

    pub fn save(&self) -> Result<SaveSummary, PersistError> {
        self.store.save_to_file()
    }

    /// Resets counters and recomputes them from every cached report.
    pub fn rebuild_counters(&self) -> usize {
        let reports = self.store.report_entries();
        self.counters
            .rebuild(reports.into_iter().map(|(key, value)| CountedReport {
                has_vulns: value.has_vulnerabilities(),
                cluster: key.cluster,
                namespace: key.namespace,
                kind: key.kind,
            }))
    }

    /// Drops every report, detail and counter of a cluster.
    pub fn remove_cluster(&self, cluster: &str) -> usize {
        let keys = self.store.keys_for_cluster(cluster);
        for key in &keys {
            self.store.delete(&key.report_key());
        }
        for key in self.store.detail_keys_for_cluster(cluster) {
            self.store.delete(&key.detail_key());
        }
        self.counters.remove_cluster(cluster);
        keys.len()
    }

    fn update_counts(&self, key: &ReportKey, prior: Option<bool>, has_vulns: bool) {
        match prior {
            None => self.increment_count(&key.cluster, &key.namespace, &key.kind, has_vulns),
            Some(prior) if prior != has_vulns => {
                let delta = if has_vulns { 1 } else { -1 };
                self.adjust_vuln_count(&key.cluster, &key.namespace, &key.kind, delta);
            }
            Some(_) => {}
        }
    }
}

impl CacheService for ReportCache {
    fn get(&self, key: &str) -> Option<CacheValue> {
        self.store.get(key)
    }

    /// Stores a value. Report values are counted exactly as they are when
    /// written by a watch.
    ///
    /// Writes to keys with a known prefix that do not follow its grammar
    /// (e.g. `report:c1:ns1`) are dropped.
    fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) {
        let parsed = match key.parse::<CacheKey>() {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(%error, "Ignoring write to a malformed cache key");
                return;
            }
        };
        match parsed {
            CacheKey::Report(report) => {
                let has_vulns = value.has_vulnerabilities();
                let prior = self
                    .store
                    .set(key, value, ttl)
                    .map(|prior| prior.value.has_vulnerabilities());
                self.update_counts(&report, prior, has_vulns);
            }
            _ => {
                self.store.set(key, value, ttl);
            }
        }
    }

    fn delete(&self, key: &str) {
        match CacheKey::parse(key) {
            CacheKey::Report(report) => {
                self.remove_report(&report);
            }
            _ => {
                self.store.delete(key);
            }
        }
    }

    fn items(&self) -> Snapshot {
        self.store.items()
    }

    fn items_by_type(&self, kind: &str) -> Snapshot {
        self.store.items_by_type(kind)
    }

    fn stats(&self) -> CacheStats {
        self.store.stats()
    }
}

impl CacheUpdater for ReportCache {
    fn set_report(&self, summary: ReportSummary) -> Option<bool> {
        let key = summary.key().report_key();
        self.store
            .set(&key, CacheValue::Report(summary), None)
            .map(|prior| prior.value.has_vulnerabilities())
    }

    fn delete_report(&self, key: &ReportKey) -> Option<bool> {
        self.store.delete(&key.detail_key());
        self.store
            .delete(&key.report_key())
            .map(|prior| prior.value.has_vulnerabilities())
    }

    fn increment_count(&self, cluster: &str, namespace: &str, kind: &str, has_vulns: bool) {
        self.counters.increment(cluster, namespace, kind, has_vulns);
    }

    fn decrement_count(&self, cluster: &str, namespace: &str, kind: &str, has_vulns: bool) {
        self.counters.decrement(cluster, namespace, kind, has_vulns);
    }

    fn adjust_vuln_count(&self, cluster: &str, namespace: &str, kind: &str, delta: i64) {
        self.counters.adjust_vuln(cluster, namespace, kind, delta);
    }
}
