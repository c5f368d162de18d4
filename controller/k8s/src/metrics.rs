use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Metrics for watches, reconciliation and detail refreshes.
#[derive(Clone, Debug, Default)]
pub struct SyncMetrics {
    watch_events: Family<WatchLabels, Counter>,
    watch_errors: Family<KindLabels, Counter>,
    synced_kinds: Family<ClusterLabels, Gauge>,
    sweeps: Family<ClusterLabels, Counter>,
    swept: Family<ClusterLabels, Counter>,
    refreshes: Family<OutcomeLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct WatchLabels {
    cluster: String,
    kind: String,
    event: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    cluster: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ClusterLabels {
    cluster: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: &'static str,
}

impl SyncMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "watch_events",
            "Count of report watch events by kind and event type",
            metrics.watch_events.clone(),
        );
        prom.register(
            "watch_errors",
            "Count of report watch errors",
            metrics.watch_errors.clone(),
        );
        prom.register(
            "synced_kinds",
            "Gauge of the number of report kinds with a synced mirror",
            metrics.synced_kinds.clone(),
        );
        prom.register(
            "sweeps",
            "Count of reconciliation sweeps by cluster",
            metrics.sweeps.clone(),
        );
        prom.register(
            "swept_reports",
            "Count of cached reports removed by reconciliation",
            metrics.swept.clone(),
        );
        prom.register(
            "detail_refreshes",
            "Count of report detail refreshes by outcome",
            metrics.refreshes.clone(),
        );
        metrics
    }

    pub(crate) fn watch_event(&self, cluster: &str, kind: &str, event: &'static str) {
        self.watch_events
            .get_or_create(&WatchLabels {
                cluster: cluster.to_string(),
                kind: kind.to_string(),
                event,
            })
            .inc();
    }

    pub(crate) fn watch_error(&self, cluster: &str, kind: &str) {
        self.watch_errors
            .get_or_create(&KindLabels {
                cluster: cluster.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    pub(crate) fn set_synced_kinds(&self, cluster: &str, n: usize) {
        self.synced_kinds
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .set(n as i64);
    }

    pub(crate) fn swept(&self, cluster: &str, removed: usize) {
        let labels = ClusterLabels {
            cluster: cluster.to_string(),
        };
        self.sweeps.get_or_create(&labels).inc();
        self.swept.get_or_create(&labels).inc_by(removed as u64);
    }

    pub(crate) fn refreshed(&self, outcome: &'static str) {
        self.refreshes
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }
}
