use crate::{metrics::CacheMetrics, weigh::entry_cost};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::{DateTime, Utc};
use moka::{notification::RemovalCause, sync::Cache, Expiry};
use parking_lot::RwLock;
use report_cache_controller_core::{CacheKey, CacheStats, CacheValue, ReportKey, Snapshot};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

/// The longest expiry tracked by the bounded layer.
const MAX_HOT_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configures a [`CacheStore`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Where snapshots are persisted. Persistence is disabled when unset.
    pub path: Option<PathBuf>,

    /// The ceiling on the estimated cost of the bounded layer.
    pub max_cost: u64,

    /// The lifetime of cluster, namespace and opaque entries written without
    /// an explicit TTL.
    pub default_ttl: Duration,

    /// The nominal lifetime of report entries. Reports never expire; this
    /// only sets the expiry recorded alongside them.
    pub report_ttl: Duration,
}

/// A single cached value.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: CacheValue,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    cost: u32,
}

/// The authoritative store of cluster, namespace, report and detail entries.
///
/// Entries live in two layers:
///
/// - a bounded layer that may drop entries when its estimated cost exceeds
///   `max_cost`, and that expires entries at their `expires_at`; and
/// - an authoritative map, with secondary indices over report keys, that is
///   the source of truth.
///
/// When the bounded layer evicts or expires a cluster, namespace or opaque
/// entry, the eviction listener purges it from the authoritative map and its
/// indices. Report and detail entries are only ever removed from the
/// authoritative map explicitly.
///
/// The authoritative lock is never held while calling into the bounded layer,
/// since the bounded layer may invoke the eviction listener (which takes the
/// lock) on the calling thread.
pub struct CacheStore {
    config: StoreConfig,
    inner: Arc<RwLock<Inner>>,
    hot: Cache<String, Arc<CacheEntry>>,
    stats: Arc<Counts>,
    metrics: CacheMetrics,
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    pub(crate) entries: HashMap<String, Arc<CacheEntry>>,

    /// Report keys by report kind.
    by_kind: HashMap<String, HashSet<String>>,

    /// Report keys by cluster.
    by_cluster: HashMap<String, HashSet<String>>,

    /// Detail keys by cluster.
    details_by_cluster: HashMap<String, HashSet<String>>,

    pub(crate) last_saved: Option<DateTime<Utc>>,

    /// Tracks the number of entries per key prefix.
    metrics: CacheMetrics,
}

#[derive(Debug, Default)]
struct Counts {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Expires bounded-layer entries at their recorded expiry. Report and detail
/// entries never expire from the bounded layer.
struct EntryExpiry;

// === impl StoreConfig ===

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_cost: 256 * 1024 * 1024,
            default_ttl: Duration::from_secs(5 * 60),
            report_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

// === impl CacheEntry ===

impl CacheEntry {
    pub fn new(
        key: CacheKey,
        value: CacheValue,
        expires_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let cost = entry_cost(&key.to_string(), &value);
        Self {
            key,
            value,
            expires_at,
            updated_at,
            cost,
        }
    }

    /// Whether the entry has passed its expiry. Report and detail entries
    /// never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.key.is_report_like() && self.is_past_expiry(now)
    }

    /// Whether the recorded expiry has passed, regardless of the key type.
    /// Detail entries past their expiry are stale and due for refresh.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn time_to_live(&self) -> Option<Duration> {
        if self.key.is_report_like() {
            return None;
        }
        let at = self.expires_at?;
        let ttl = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        // Lookups check the recorded expiry, so far-off expiries need not be
        // tracked by the bounded layer.
        (ttl <= MAX_HOT_TTL).then_some(ttl)
    }
}

// === impl CacheStore ===

impl CacheStore {
    pub fn new(config: StoreConfig, metrics: CacheMetrics) -> Self {
        let inner = Arc::new(RwLock::new(Inner {
            metrics: metrics.clone(),
            ..Default::default()
        }));
        let stats = Arc::new(Counts::default());

        let hot = {
            let inner = Arc::downgrade(&inner);
            let stats = stats.clone();
            let metrics = metrics.clone();
            Cache::builder()
                .max_capacity(config.max_cost)
                .weigher(|_key: &String, entry: &Arc<CacheEntry>| entry.cost)
                .expire_after(EntryExpiry)
                .eviction_listener(move |key: Arc<String>, entry, cause| {
                    on_evict(&inner, &stats, &metrics, &key, entry, cause)
                })
                .build()
        };

        Self {
            config,
            inner,
            hot,
            stats,
            metrics,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn get(&self, key: &str) -> Option<CacheValue> {
        self.get_entry(key).map(|entry| entry.value.clone())
    }

    /// Looks up an entry, returning a shared handle to it.
    pub fn get_entry(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let now = Utc::now();
        if let Some(entry) = self.hot.get(key) {
            if !entry.is_expired(now) {
                self.record_hit();
                return Some(entry);
            }
        }

        let entry = self.inner.read().entries.get(key).cloned();
        match entry {
            Some(entry) if !entry.is_expired(now) => {
                self.promote(key, &entry);
                self.record_hit();
                Some(entry)
            }
            Some(expired) => {
                self.remove_if_current(key, &expired);
                self.record_miss();
                None
            }
            None => {
                self.record_miss();
                None
            }
        }
    }

    /// Stores a value, returning the entry it replaced.
    ///
    /// When `ttl` is unset, report and detail entries use the report TTL and
    /// all other entries use the default TTL.
    pub fn set(
        &self,
        key: &str,
        value: CacheValue,
        ttl: Option<Duration>,
    ) -> Option<Arc<CacheEntry>> {
        let parsed = CacheKey::parse(key);
        let ttl = ttl.unwrap_or(if parsed.is_report_like() {
            self.config.report_ttl
        } else {
            self.config.default_ttl
        });
        let now = Utc::now();
        let expires_at = expiry_after(now, ttl);
        let entry = Arc::new(CacheEntry::new(parsed, value, expires_at, now));
        self.insert_entry(key.to_string(), entry)
    }

    pub(crate) fn insert_entry(
        &self,
        key: String,
        entry: Arc<CacheEntry>,
    ) -> Option<Arc<CacheEntry>> {
        self.metrics.write(entry.key.prefix());
        let prior = self.inner.write().insert(key.clone(), entry.clone());
        self.promote(&key, &entry);
        prior
    }

    /// Removes an entry, returning it if it was present.
    pub fn delete(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let removed = self.inner.write().remove(key);
        self.hot.invalidate(key);
        if let Some(entry) = removed.as_ref() {
            self.metrics.delete(entry.key.prefix());
        }
        removed
    }

    /// Returns a copy of every live entry.
    pub fn items(&self) -> Snapshot {
        let now = Utc::now();
        self.inner
            .read()
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Returns a copy of every report summary of the given kind.
    pub fn items_by_type(&self, kind: &str) -> Snapshot {
        let inner = self.inner.read();
        let Some(keys) = inner.by_kind.get(kind) else {
            return Snapshot::new();
        };
        keys.iter()
            .filter_map(|key| {
                let entry = inner.entries.get(key)?;
                Some((key.clone(), entry.value.clone()))
            })
            .collect()
    }

    /// Returns the keys of every cached report in a cluster.
    pub fn keys_for_cluster(&self, cluster: &str) -> Vec<ReportKey> {
        let inner = self.inner.read();
        let Some(keys) = inner.by_cluster.get(cluster) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|key| inner.entries.get(key)?.key.report().cloned())
            .collect()
    }

    /// Returns the report keys of every cached detail in a cluster.
    pub fn detail_keys_for_cluster(&self, cluster: &str) -> Vec<ReportKey> {
        let inner = self.inner.read();
        let Some(keys) = inner.details_by_cluster.get(cluster) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|key| match &inner.entries.get(key)?.key {
                CacheKey::Detail(report) => Some(report.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether an entry is held in the authoritative map, regardless of its
    /// expiry. Does not count as a lookup.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    /// Returns the names of every cluster with cached reports or details.
    pub fn clusters_with_reports(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut clusters = inner
            .by_cluster
            .iter()
            .chain(inner.details_by_cluster.iter())
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(cluster, _)| cluster.clone())
            .collect::<Vec<_>>();
        clusters.sort();
        clusters.dedup();
        clusters
    }

    /// Returns every cached report summary along with its key.
    pub fn report_entries(&self) -> Vec<(ReportKey, CacheValue)> {
        let inner = self.inner.read();
        inner
            .by_cluster
            .values()
            .flatten()
            .filter_map(|key| {
                let entry = inner.entries.get(key)?;
                let report = entry.key.report()?.clone();
                Some((report, entry.value.clone()))
            })
            .collect()
    }

    /// Returns the values of every namespace entry of a cluster, including
    /// entries past their expiry that have not yet been purged.
    pub fn namespace_entries(&self, cluster: &str) -> Vec<(String, CacheValue)> {
        let prefix = report_cache_controller_core::key::namespace_prefix(cluster);
        self.inner
            .read()
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Removes every expired cluster, namespace and opaque entry.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired = {
            let mut inner = self.inner.write();
            let keys = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            for key in &keys {
                inner.remove(key);
            }
            keys
        };
        for key in &expired {
            self.hot.invalidate(key);
        }
        if !expired.is_empty() {
            tracing::debug!(expired = expired.len(), "Purged expired entries");
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.hot.run_pending_tasks();
        let mut stats = {
            let inner = self.inner.read();
            let mut stats = CacheStats {
                entries: inner.entries.len(),
                report_kinds: inner.by_kind.values().filter(|k| !k.is_empty()).count(),
                last_saved: inner.last_saved,
                ..Default::default()
            };
            for entry in inner.entries.values() {
                match entry.key {
                    CacheKey::Cluster(_) => stats.clusters += 1,
                    CacheKey::Namespace { .. } => stats.namespaces += 1,
                    CacheKey::Report(_) => stats.reports += 1,
                    CacheKey::Detail(_) => stats.details += 1,
                    CacheKey::Other(_) => stats.other += 1,
                }
            }
            stats
        };
        stats.hot_entries = self.hot.entry_count();
        stats.hot_cost = self.hot.weighted_size();
        stats.max_cost = self.config.max_cost;
        stats.hits = self.stats.hits.load(Ordering::Relaxed);
        stats.misses = self.stats.misses.load(Ordering::Relaxed);
        stats.evictions = self.stats.evictions.load(Ordering::Relaxed);
        stats
    }

    /// Drives the bounded layer's pending maintenance (evictions and
    /// expirations) to completion.
    pub fn run_pending_tasks(&self) {
        self.hot.run_pending_tasks();
    }

    pub(crate) fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub(crate) fn inner(&self) -> &RwLock<Inner> {
        &self.inner
    }

    /// Drops the bounded layer's contents; it refills from the authoritative
    /// map on demand.
    pub(crate) fn clear_hot(&self) {
        self.hot.invalidate_all();
    }

    /// Inserts an entry into the bounded layer, then drops it again if a
    /// concurrent write or delete has replaced it in the authoritative map.
    fn promote(&self, key: &str, entry: &Arc<CacheEntry>) {
        self.hot.insert(key.to_string(), entry.clone());
        let current = self
            .inner
            .read()
            .entries
            .get(key)
            .is_some_and(|e| Arc::ptr_eq(e, entry));
        if !current {
            self.hot.invalidate(key);
        }
    }

    fn remove_if_current(&self, key: &str, entry: &Arc<CacheEntry>) {
        let removed = self.inner.write().remove_if_current(key, entry);
        if removed {
            self.hot.invalidate(key);
        }
    }

    fn record_hit(&self) {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.hit();
    }

    fn record_miss(&self) {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.miss();
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("entries", &self.inner.read().entries.len())
            .field("hot_entries", &self.hot.entry_count())
            .finish()
    }
}

/// Handles removals from the bounded layer.
///
/// Only size evictions and expirations of non-report entries propagate to the
/// authoritative map. Replacements and explicit invalidations are the result
/// of authoritative writes and need no further bookkeeping.
fn on_evict(
    inner: &Weak<RwLock<Inner>>,
    stats: &Counts,
    metrics: &CacheMetrics,
    key: &str,
    entry: Arc<CacheEntry>,
    cause: RemovalCause,
) {
    let cause = match cause {
        RemovalCause::Size => "size",
        RemovalCause::Expired => "expired",
        RemovalCause::Explicit | RemovalCause::Replaced => return,
    };
    stats.evictions.fetch_add(1, Ordering::Relaxed);
    metrics.evict(entry.key.prefix(), cause);

    if entry.key.is_report_like() {
        return;
    }
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if inner.write().remove_if_current(key, &entry) {
        tracing::debug!(%key, %cause, "Evicted entry");
    }
}

/// Returns `now + ttl`, or no expiry when the sum is not representable.
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    now.checked_add_signed(ttl)
}

// === impl Inner ===

impl Inner {
    /// Inserts an entry and indexes it, returning the entry it replaced.
    pub(crate) fn insert(
        &mut self,
        key: String,
        entry: Arc<CacheEntry>,
    ) -> Option<Arc<CacheEntry>> {
        match &entry.key {
            CacheKey::Report(report) => {
                self.by_kind
                    .entry(report.kind.clone())
                    .or_default()
                    .insert(key.clone());
                self.by_cluster
                    .entry(report.cluster.clone())
                    .or_default()
                    .insert(key.clone());
            }
            CacheKey::Detail(report) => {
                self.details_by_cluster
                    .entry(report.cluster.clone())
                    .or_default()
                    .insert(key.clone());
            }
            _ => {}
        }
        self.metrics.entry_added(entry.key.prefix());
        let prior = self.entries.insert(key, entry);
        if let Some(prior) = prior.as_ref() {
            self.metrics.entry_removed(prior.key.prefix());
        }
        prior
    }

    /// Removes an entry and every index reference to it.
    ///
    /// All removals (explicit deletes, reconciliation, eviction and expiry)
    /// go through this method.
    pub(crate) fn remove(&mut self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.remove(key)?;
        self.metrics.entry_removed(entry.key.prefix());
        match &entry.key {
            CacheKey::Report(report) => {
                unindex(&mut self.by_kind, &report.kind, key);
                unindex(&mut self.by_cluster, &report.cluster, key);
            }
            CacheKey::Detail(report) => {
                unindex(&mut self.details_by_cluster, &report.cluster, key);
            }
            _ => {}
        }
        Some(entry)
    }

    /// Removes an entry only if it has not been replaced since `entry` was
    /// read.
    fn remove_if_current(&mut self, key: &str, entry: &Arc<CacheEntry>) -> bool {
        let current = self
            .entries
            .get(key)
            .is_some_and(|e| Arc::ptr_eq(e, entry));
        current && self.remove(key).is_some()
    }

    /// Replaces all contents.
    pub(crate) fn replace(&mut self, entries: impl IntoIterator<Item = (String, Arc<CacheEntry>)>) {
        let last_saved = self.last_saved;
        let metrics = self.metrics.clone();
        metrics.clear_entries();
        *self = Self {
            last_saved,
            metrics,
            ..Default::default()
        };
        for (key, entry) in entries {
            self.insert(key, entry);
        }
    }
}

fn unindex(index: &mut HashMap<String, HashSet<String>>, group: &str, key: &str) {
    if let Some(keys) = index.get_mut(group) {
        keys.remove(key);
        if keys.is_empty() {
            index.remove(group);
        }
    }
}

// === impl EntryExpiry ===

impl Expiry<String, Arc<CacheEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Arc<CacheEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        entry.time_to_live()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Arc<CacheEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        entry.time_to_live()
    }
}
