use kube::api::DynamicObject;
use report_cache_controller_core::{
    kinds::ReportKind, CacheUpdater, ReportChange, ReportKey, ReportMeta, ReportSummary,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Translates watched report objects into cache updates for one cluster.
#[derive(Clone)]
pub struct ReportHandler {
    cluster: String,
    updater: Arc<dyn CacheUpdater>,
}

// === impl ReportHandler ===

impl ReportHandler {
    pub fn new(cluster: impl Into<String>, updater: Arc<dyn CacheUpdater>) -> Self {
        Self {
            cluster: cluster.into(),
            updater,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Caches the summary of an added or updated report.
    ///
    /// Returns `None` when the object has no name.
    pub fn apply(&self, kind: &ReportKind, obj: &DynamicObject) -> Option<ReportChange> {
        let key = self.key(kind, obj)?;
        let summary = project(&key, obj);
        let change = self.updater.apply_report(summary);
        trace!(%key, ?change, "Applied report");
        Some(change)
    }

    /// Drops a deleted report. Returns whether it was cached.
    pub fn delete(&self, kind: &ReportKind, obj: &DynamicObject) -> bool {
        let Some(key) = self.key(kind, obj) else {
            return false;
        };
        let removed = self.updater.remove_report(&key);
        debug!(%key, removed, "Deleted report");
        removed
    }

    pub fn key(&self, kind: &ReportKind, obj: &DynamicObject) -> Option<ReportKey> {
        let Some(name) = obj.metadata.name.as_deref() else {
            debug!(kind = %kind.name, "Ignoring report without a name");
            return None;
        };
        let namespace = if kind.namespaced {
            obj.metadata.namespace.as_deref().unwrap_or_default()
        } else {
            ""
        };
        Some(ReportKey::new(&self.cluster, namespace, &kind.name, name))
    }
}

impl std::fmt::Debug for ReportHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportHandler")
            .field("cluster", &self.cluster)
            .finish()
    }
}

/// Projects a report object into its cached summary.
pub fn project(key: &ReportKey, obj: &DynamicObject) -> ReportSummary {
    let meta = ReportMeta {
        uid: obj.metadata.uid.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        // Round-trip through the wire form so the conversion does not depend
        // on the time library backing the API types.
        creation_timestamp: obj
            .metadata
            .creation_timestamp
            .as_ref()
            .and_then(|ts| serde_json::to_value(ts).ok())
            .and_then(|ts| serde_json::from_value(ts).ok()),
        labels: obj.metadata.labels.clone().unwrap_or_default(),
    };
    ReportSummary::project(key, meta, &obj.data)
}
