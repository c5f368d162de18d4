//! Approximate serialized size of cached values.
//!
//! The estimate only has to grow with the size of a value so that the bounded
//! layer can keep its total cost under a ceiling; it is not exact.

use report_cache_controller_core::{
    CacheValue, ClusterRecord, NamespaceRecord, ReportDetail, ReportMeta, ReportSummary,
};
use serde_json::Value;

/// Fixed cost charged to every entry for bookkeeping.
const ENTRY_OVERHEAD: u64 = 64;
const SCALAR: u64 = 8;
const UNIT: u64 = 1;

pub(crate) trait Weigh {
    fn weigh(&self) -> u64;
}

/// The cost of a cache entry, saturated to fit the bounded layer's weigher.
pub(crate) fn entry_cost(key: &str, value: &CacheValue) -> u32 {
    let cost = ENTRY_OVERHEAD + key.len() as u64 + value.weigh();
    u32::try_from(cost).unwrap_or(u32::MAX)
}

impl Weigh for str {
    fn weigh(&self) -> u64 {
        self.len() as u64
    }
}

impl Weigh for String {
    fn weigh(&self) -> u64 {
        self.len() as u64
    }
}

impl<T: Weigh> Weigh for Option<T> {
    fn weigh(&self) -> u64 {
        self.as_ref().map_or(UNIT, |v| v.weigh())
    }
}

impl<T: Weigh> Weigh for [T] {
    fn weigh(&self) -> u64 {
        self.iter().map(Weigh::weigh).sum()
    }
}

impl Weigh for Value {
    fn weigh(&self) -> u64 {
        match self {
            Value::Null | Value::Bool(_) => UNIT,
            Value::Number(_) => SCALAR,
            Value::String(s) => s.weigh(),
            Value::Array(items) => items.weigh(),
            Value::Object(fields) => fields.iter().map(|(k, v)| k.weigh() + v.weigh()).sum(),
        }
    }
}

impl Weigh for CacheValue {
    fn weigh(&self) -> u64 {
        match self {
            Self::Cluster(record) => record.weigh(),
            Self::Namespace(record) => record.weigh(),
            Self::Report(summary) => summary.weigh(),
            Self::Detail(detail) => detail.weigh(),
            Self::Json(value) => value.weigh(),
        }
    }
}

impl Weigh for ClusterRecord {
    fn weigh(&self) -> u64 {
        self.name.weigh()
            + self.api_server_url.weigh()
            + self.version.weigh()
            + self.namespaces.weigh()
    }
}

impl Weigh for NamespaceRecord {
    fn weigh(&self) -> u64 {
        self.cluster.weigh() + self.name.weigh()
    }
}

impl Weigh for ReportMeta {
    fn weigh(&self) -> u64 {
        let timestamp = self.creation_timestamp.map_or(UNIT, |_| SCALAR);
        let labels: u64 = self
            .labels
            .iter()
            .map(|(k, v)| k.weigh() + v.weigh())
            .sum();
        self.uid.weigh() + self.resource_version.weigh() + timestamp + labels
    }
}

impl Weigh for ReportSummary {
    fn weigh(&self) -> u64 {
        let sections: u64 = self
            .sections
            .iter()
            .map(|(k, v)| k.weigh() + v.weigh())
            .sum();
        self.cluster.weigh()
            + self.namespace.weigh()
            + self.kind.weigh()
            + self.name.weigh()
            + self.meta.weigh()
            + 5 * SCALAR
            + sections
    }
}

impl Weigh for ReportDetail {
    fn weigh(&self) -> u64 {
        self.cluster.weigh()
            + self.namespace.weigh()
            + self.kind.weigh()
            + self.name.weigh()
            + self.raw.weigh()
    }
}
