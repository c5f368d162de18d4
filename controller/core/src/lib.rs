//! Report Cache Controller
//!
//! The controller mirrors security-scan reports from many clusters into a single in-process cache
//! so that the dashboard never has to query a cluster to render a page. This crate holds the
//! types shared by the cache, the cluster watches and the API layer:
//!
//! - [`CacheKey`] and [`ReportKey`] model the structured cache key grammar.
//! - [`CacheValue`] holds typed summaries of reports and opaque report details.
//! - [`CacheService`] is the narrow read/write interface exposed to the API layer.
//! - [`CacheUpdater`] is the interface through which watch events mutate the cache and its
//!   counters.
//!
//! ```text
//! [ watch ] -> [ CacheUpdater ] -> [ store ] + [ counters ] <- [ CacheService ] <- [ API ]
//! ```

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod key;
pub mod kinds;
pub mod value;

pub use self::{
    key::{CacheKey, KeyError, ReportKey},
    kinds::ReportKind,
    value::{
        CacheValue, ClusterRecord, NamespaceRecord, ReportDetail, ReportMeta, ReportSummary,
        SeverityCounts,
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, time::Duration};

/// A point-in-time copy of cached values, keyed by cache key string.
pub type Snapshot = HashMap<String, CacheValue>;

/// Aggregate report counts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterPair {
    pub total: u64,
    pub with_vulnerabilities: u64,
}

/// Describes the state of the cache for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub clusters: usize,
    pub namespaces: usize,
    pub reports: usize,
    pub details: usize,
    pub other: usize,
    pub report_kinds: usize,

    /// Entries resident in the bounded fast layer.
    pub hot_entries: u64,
    /// Estimated cost of the fast layer.
    pub hot_cost: u64,
    pub max_cost: u64,

    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,

    pub last_saved: Option<DateTime<Utc>>,
}

/// The cache interface exposed to the API layer.
pub trait CacheService: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheValue>;

    /// Stores a value. `ttl` bounds the lifetime of cluster and namespace
    /// entries; report entries are only ever removed explicitly.
    fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>);

    fn delete(&self, key: &str);

    fn items(&self) -> Snapshot;

    /// Returns every cached report summary of the given kind.
    fn items_by_type(&self, kind: &str) -> Snapshot;

    fn stats(&self) -> CacheStats;
}

/// The interface through which watch events mutate the cache.
///
/// Cache writes and counter writes are separate operations; callers must not
/// assume atomicity across the two.
pub trait CacheUpdater: Send + Sync {
    /// Stores a report summary, returning the vulnerability status of the
    /// summary it replaced, if any.
    fn set_report(&self, summary: ReportSummary) -> Option<bool>;

    /// Removes a report and its detail, returning the last known
    /// vulnerability status if the report was cached.
    fn delete_report(&self, key: &ReportKey) -> Option<bool>;

    fn increment_count(&self, cluster: &str, namespace: &str, kind: &str, has_vulns: bool);

    fn decrement_count(&self, cluster: &str, namespace: &str, kind: &str, has_vulns: bool);

    fn adjust_vuln_count(&self, cluster: &str, namespace: &str, kind: &str, delta: i64);

    /// Stores a report and updates counters.
    ///
    /// A new report is counted; a replaced report only adjusts the
    /// vulnerability count when its status flipped.
    fn apply_report(&self, summary: ReportSummary) -> ReportChange {
        let key = summary.key();
        let has_vulns = summary.has_vulnerabilities();
        match self.set_report(summary) {
            None => {
                self.increment_count(&key.cluster, &key.namespace, &key.kind, has_vulns);
                ReportChange::Added
            }
            Some(prior) if prior != has_vulns => {
                let delta = if has_vulns { 1 } else { -1 };
                self.adjust_vuln_count(&key.cluster, &key.namespace, &key.kind, delta);
                ReportChange::VulnsChanged
            }
            Some(_) => ReportChange::Unchanged,
        }
    }

    /// Removes a report and decrements counters with its last known status.
    ///
    /// This is the only deletion path for reports, shared by live delete
    /// events and reconciliation.
    fn remove_report(&self, key: &ReportKey) -> bool {
        match self.delete_report(key) {
            Some(has_vulns) => {
                self.decrement_count(&key.cluster, &key.namespace, &key.kind, has_vulns);
                true
            }
            None => false,
        }
    }
}

/// Describes how [`CacheUpdater::apply_report`] changed the counters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReportChange {
    Added,
    VulnsChanged,
    Unchanged,
}
