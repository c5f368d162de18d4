use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Metrics describing cache activity.
///
/// Unregistered metrics (via `Default`) are fully functional, which keeps
/// test setup free of a registry.
#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    lookups: Family<LookupLabels, Counter>,
    writes: Family<PrefixLabels, Counter>,
    deletes: Family<PrefixLabels, Counter>,
    evictions: Family<EvictionLabels, Counter>,
    entries: Family<PrefixLabels, Gauge>,
    saves: Family<ResultLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct LookupLabels {
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PrefixLabels {
    prefix: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EvictionLabels {
    prefix: &'static str,
    cause: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: &'static str,
}

impl CacheMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "lookups",
            "Count of cache lookups by result",
            metrics.lookups.clone(),
        );
        prom.register(
            "writes",
            "Count of cache writes by key prefix",
            metrics.writes.clone(),
        );
        prom.register(
            "deletes",
            "Count of cache deletions by key prefix",
            metrics.deletes.clone(),
        );
        prom.register(
            "evictions",
            "Count of entries evicted from the bounded layer",
            metrics.evictions.clone(),
        );
        prom.register(
            "entries",
            "Gauge of the number of entries in the cache by key prefix",
            metrics.entries.clone(),
        );
        prom.register(
            "saves",
            "Count of cache snapshot writes by result",
            metrics.saves.clone(),
        );
        metrics
    }

    pub(crate) fn hit(&self) {
        self.lookups
            .get_or_create(&LookupLabels { result: "hit" })
            .inc();
    }

    pub(crate) fn miss(&self) {
        self.lookups
            .get_or_create(&LookupLabels { result: "miss" })
            .inc();
    }

    pub(crate) fn write(&self, prefix: &'static str) {
        self.writes.get_or_create(&PrefixLabels { prefix }).inc();
    }

    pub(crate) fn delete(&self, prefix: &'static str) {
        self.deletes.get_or_create(&PrefixLabels { prefix }).inc();
    }

    pub(crate) fn evict(&self, prefix: &'static str, cause: &'static str) {
        self.evictions
            .get_or_create(&EvictionLabels { prefix, cause })
            .inc();
    }

    pub(crate) fn entry_added(&self, prefix: &'static str) {
        self.entries.get_or_create(&PrefixLabels { prefix }).inc();
    }

    pub(crate) fn entry_removed(&self, prefix: &'static str) {
        self.entries.get_or_create(&PrefixLabels { prefix }).dec();
    }

    pub(crate) fn clear_entries(&self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn entries(&self, prefix: &'static str) -> i64 {
        self.entries.get_or_create(&PrefixLabels { prefix }).get()
    }

    pub(crate) fn saved(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.saves.get_or_create(&ResultLabels { result }).inc();
    }
}
