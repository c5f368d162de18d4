use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use report_cache_controller_core::CounterPair;
use std::collections::BTreeMap;

/// Maintains aggregate report counts per cluster and per cluster+namespace,
/// independent of the cache contents.
///
/// All arithmetic happens under a single lock that is held only for the
/// duration of the update. Callers must never hold the store's lock while
/// calling into the registry.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    inner: Mutex<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    by_cluster: HashMap<ClusterKind, CounterPair>,
    by_namespace: HashMap<NamespaceKind, CounterPair>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ClusterKind {
    cluster: String,
    kind: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct NamespaceKind {
    cluster: String,
    namespace: String,
    kind: String,
}

/// A report's contribution to the counters, used when rebuilding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountedReport {
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
    pub has_vulns: bool,
}

// === impl CounterRegistry ===

impl CounterRegistry {
    pub fn increment(&self, cluster: &str, namespace: &str, kind: &str, has_vulns: bool) {
        self.inner
            .lock()
            .update(cluster, namespace, kind, |pair| pair.increment(has_vulns));
    }

    /// Decrements counts, clamping at zero so that a delete replayed before
    /// its add cannot drive a counter negative.
    pub fn decrement(&self, cluster: &str, namespace: &str, kind: &str, has_vulns: bool) {
        self.inner
            .lock()
            .update_existing(cluster, namespace, kind, |pair| pair.decrement(has_vulns));
    }

    /// Moves a counted report in or out of the vulnerable count. Aggregates
    /// that were never incremented are left alone.
    pub fn adjust_vuln(&self, cluster: &str, namespace: &str, kind: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        self.inner
            .lock()
            .update_existing(cluster, namespace, kind, |pair| pair.adjust_vulns(delta));
    }

    pub fn get_counts(&self, cluster: &str, kind: &str) -> Option<CounterPair> {
        self.inner
            .lock()
            .by_cluster
            .get(&ClusterKind::new(cluster, kind))
            .copied()
    }

    pub fn get_counts_by_namespace(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
    ) -> Option<CounterPair> {
        self.inner
            .lock()
            .by_namespace
            .get(&NamespaceKind::new(cluster, namespace, kind))
            .copied()
    }

    /// Sums a kind's counts across every cluster.
    pub fn get_counts_all_clusters(&self, kind: &str) -> CounterPair {
        self.inner
            .lock()
            .by_cluster
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .fold(CounterPair::default(), |acc, (_, pair)| CounterPair {
                total: acc.total + pair.total,
                with_vulnerabilities: acc.with_vulnerabilities + pair.with_vulnerabilities,
            })
    }

    pub fn reset(&self) {
        let mut counters = self.inner.lock();
        counters.by_cluster.clear();
        counters.by_namespace.clear();
    }

    /// Replaces all counts with those derived from `reports`.
    pub fn rebuild(&self, reports: impl IntoIterator<Item = CountedReport>) -> usize {
        let mut rebuilt = Counters::default();
        let mut n = 0;
        for report in reports {
            rebuilt.update(&report.cluster, &report.namespace, &report.kind, |pair| {
                pair.increment(report.has_vulns)
            });
            n += 1;
        }
        *self.inner.lock() = rebuilt;
        n
    }

    /// Drops every count for a cluster.
    pub fn remove_cluster(&self, cluster: &str) {
        let mut counters = self.inner.lock();
        counters.by_cluster.retain(|k, _| k.cluster != cluster);
        counters.by_namespace.retain(|k, _| k.cluster != cluster);
    }

    /// Returns the cluster-level counts, keyed by cluster and then kind.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, CounterPair>> {
        let counters = self.inner.lock();
        let mut snapshot = BTreeMap::<String, BTreeMap<String, CounterPair>>::new();
        for (k, pair) in counters.by_cluster.iter() {
            snapshot
                .entry(k.cluster.clone())
                .or_default()
                .insert(k.kind.clone(), *pair);
        }
        snapshot
    }
}

// === impl Counters ===

impl Counters {
    /// Applies `f` to the cluster aggregate and, when a namespace is given, to
    /// the namespace aggregate, creating either if absent.
    fn update(&mut self, cluster: &str, namespace: &str, kind: &str, f: impl Fn(&mut CounterPair)) {
        f(self
            .by_cluster
            .entry(ClusterKind::new(cluster, kind))
            .or_default());
        if !namespace.is_empty() {
            f(self
                .by_namespace
                .entry(NamespaceKind::new(cluster, namespace, kind))
                .or_default());
        }
    }

    /// Like `update`, but never creates aggregates.
    fn update_existing(
        &mut self,
        cluster: &str,
        namespace: &str,
        kind: &str,
        f: impl Fn(&mut CounterPair),
    ) {
        if let Some(pair) = self.by_cluster.get_mut(&ClusterKind::new(cluster, kind)) {
            f(pair);
        }
        if !namespace.is_empty() {
            if let Some(pair) = self
                .by_namespace
                .get_mut(&NamespaceKind::new(cluster, namespace, kind))
            {
                f(pair);
            }
        }
    }
}

impl ClusterKind {
    fn new(cluster: &str, kind: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            kind: kind.to_string(),
        }
    }
}

impl NamespaceKind {
    fn new(cluster: &str, namespace: &str, kind: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            kind: kind.to_string(),
        }
    }
}

trait PairExt {
    fn increment(&mut self, has_vulns: bool);
    fn decrement(&mut self, has_vulns: bool);
    fn adjust_vulns(&mut self, delta: i64);
}

impl PairExt for CounterPair {
    fn increment(&mut self, has_vulns: bool) {
        self.total += 1;
        if has_vulns {
            self.with_vulnerabilities += 1;
        }
    }

    fn decrement(&mut self, has_vulns: bool) {
        self.total = self.total.saturating_sub(1);
        if has_vulns {
            self.with_vulnerabilities = self.with_vulnerabilities.saturating_sub(1);
        }
    }

    fn adjust_vulns(&mut self, delta: i64) {
        self.with_vulnerabilities = self
            .with_vulnerabilities
            .saturating_add_signed(delta)
            .min(self.total);
    }
}
