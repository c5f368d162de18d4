use crate::{cluster::ClusterRegistry, metrics::SyncMetrics};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use report_cache_controller_core::{
    kinds::ReportKind, CacheService, CacheValue, ReportDetail, ReportKey,
};
use report_cache_controller_store::ReportCache;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, warn, Instrument};

#[derive(Clone, Debug)]
pub struct DetailConfig {
    pub ttl: Duration,
    pub jitter: Duration,
    pub fetch_timeout: Duration,
}

/// A cached detail and whether it is within its expiry.
#[derive(Clone, Debug, PartialEq)]
pub struct DetailLookup {
    pub value: Option<ReportDetail>,
    pub fresh: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another refresh of the same report was already running.
    InFlight,
    Refreshed,
    NotFound,
    Failed,
}

/// Fetches full report objects on demand.
///
/// Summaries omit the large per-finding arrays, so the full object is fetched
/// from the cluster when it is first requested and cached with a jittered
/// expiry. At most one fetch per report runs at a time.
pub struct DetailRefreshCoordinator {
    cache: ReportCache,
    clusters: Arc<ClusterRegistry>,
    kinds: RwLock<HashMap<String, ReportKind>>,
    in_flight: Arc<Mutex<HashSet<ReportKey>>>,
    config: DetailConfig,
    metrics: SyncMetrics,
}

/// Marks a report as being refreshed until dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<ReportKey>>>,
    key: ReportKey,
}

// === impl DetailConfig ===

impl Default for DetailConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            jitter: Duration::from_secs(5 * 60),
            fetch_timeout: Duration::from_secs(15),
        }
    }
}

// === impl RefreshOutcome ===

impl RefreshOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Refreshed => "refreshed",
            Self::NotFound => "not_found",
            Self::Failed => "failed",
        }
    }
}

// === impl DetailRefreshCoordinator ===

impl DetailRefreshCoordinator {
    pub fn new(
        cache: ReportCache,
        clusters: Arc<ClusterRegistry>,
        kinds: impl IntoIterator<Item = ReportKind>,
        config: DetailConfig,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            cache,
            clusters,
            kinds: RwLock::new(kinds.into_iter().map(|k| (k.name.clone(), k)).collect()),
            in_flight: Default::default(),
            config,
            metrics,
        }
    }

    /// Adds kinds discovered after construction.
    pub fn register_kinds(&self, kinds: impl IntoIterator<Item = ReportKind>) {
        let mut known = self.kinds.write();
        for kind in kinds {
            known.insert(kind.name.clone(), kind);
        }
    }

    /// Returns the cached detail of a report, possibly stale.
    ///
    /// A refresh is started in the background when the detail is missing or
    /// past its expiry; the caller is never blocked on the cluster.
    pub fn get_detail(self: &Arc<Self>, key: &ReportKey) -> DetailLookup {
        let entry = self.cache.store().get_entry(&key.detail_key());
        let value = entry.as_ref().and_then(|e| e.value.as_detail().cloned());
        let fresh = match (&entry, &value) {
            (Some(entry), Some(_)) => !entry.is_past_expiry(Utc::now()),
            _ => false,
        };

        if !fresh && !self.is_in_flight(key) {
            let this = self.clone();
            let key = key.clone();
            let span = tracing::debug_span!("refresh", %key);
            tokio::spawn(
                async move {
                    this.refresh_detail(&key).await;
                }
                .instrument(span),
            );
        }

        DetailLookup { value, fresh }
    }

    /// Fetches a report from its cluster and caches it as a detail entry.
    ///
    /// Concurrent calls for the same report share a single fetch: all but
    /// the first return [`RefreshOutcome::InFlight`] immediately. Failures
    /// leave cached data untouched and are not retried.
    pub async fn refresh_detail(&self, key: &ReportKey) -> RefreshOutcome {
        let outcome = match InFlight::acquire(&self.in_flight, key) {
            Some(_guard) => self.fetch(key).await,
            None => RefreshOutcome::InFlight,
        };
        self.metrics.refreshed(outcome.as_str());
        outcome
    }

    pub fn is_in_flight(&self, key: &ReportKey) -> bool {
        self.in_flight.lock().contains(key)
    }

    async fn fetch(&self, key: &ReportKey) -> RefreshOutcome {
        let Some(client) = self.clusters.get(&key.cluster) else {
            warn!(%key, "Cannot refresh report of an unknown cluster");
            return RefreshOutcome::Failed;
        };
        let kind = self.kind(key);

        let fetch = client.api.get_report(&kind, &key.namespace, &key.name);
        match time::timeout(self.config.fetch_timeout, fetch).await {
            Ok(Ok(Some(raw))) => {
                let ttl = jittered_ttl(self.config.ttl, self.config.jitter);
                self.cache.set(
                    &key.detail_key(),
                    CacheValue::Detail(ReportDetail::new(key, raw)),
                    Some(ttl),
                );
                debug!(%key, ?ttl, "Refreshed report detail");
                RefreshOutcome::Refreshed
            }
            Ok(Ok(None)) => {
                debug!(%key, "Report not found");
                RefreshOutcome::NotFound
            }
            Ok(Err(error)) => {
                warn!(%key, %error, "Failed to fetch report");
                RefreshOutcome::Failed
            }
            Err(_) => {
                warn!(%key, timeout = ?self.config.fetch_timeout, "Timed out fetching report");
                RefreshOutcome::Failed
            }
        }
    }

    fn kind(&self, key: &ReportKey) -> ReportKind {
        if let Some(kind) = self.kinds.read().get(&key.kind) {
            return kind.clone();
        }
        // Only the plural name and scope are needed to address the resource.
        ReportKind::new(&key.kind, !key.is_cluster_scoped(), "")
    }
}

impl std::fmt::Debug for DetailRefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetailRefreshCoordinator")
            .field("in_flight", &self.in_flight.lock().len())
            .field("config", &self.config)
            .finish()
    }
}

// === impl InFlight ===

impl InFlight {
    fn acquire(set: &Arc<Mutex<HashSet<ReportKey>>>, key: &ReportKey) -> Option<Self> {
        if !set.lock().insert(key.clone()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            key: key.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Returns `ttl` plus a random duration in `[0, jitter)`, spreading the
/// expiry of details fetched together.
pub fn jittered_ttl(ttl: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return ttl;
    }
    ttl.saturating_add(rand::thread_rng().gen_range(Duration::ZERO..jitter))
}
