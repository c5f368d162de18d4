#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use report_cache_controller_core as core;
pub use report_cache_controller_k8s as k8s;
pub use report_cache_controller_store as store;

mod args;

pub use self::args::Args;

use self::{
    core::{kinds::ReportKind, CacheService},
    k8s::{
        ClusterConfig, ClusterRegistry, DetailConfig, DetailRefreshCoordinator, InformerConfig,
        InformerManager, KubeClusterApi, MirrorSet, ReconciliationSweeper, ReportHandler,
        SweepConfig, SyncMetrics,
    },
    store::{
        CacheMetrics, CacheStore, CounterRegistry, LoadSummary, PersistError, ReportCache,
        StoreConfig,
    },
};
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, warn};

/// The shared state of a running controller.
///
/// A single cache, counter registry and cluster registry are constructed at
/// startup and handed to every task.
#[derive(Clone, Debug)]
pub struct Controller {
    cache: ReportCache,
    clusters: Arc<ClusterRegistry>,
    details: Arc<DetailRefreshCoordinator>,
    mirrors: MirrorSet,
    kinds: Vec<ReportKind>,
    metrics: SyncMetrics,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        store_config: StoreConfig,
        cache_metrics: CacheMetrics,
        cluster_config: ClusterConfig,
        detail_config: DetailConfig,
        metrics: SyncMetrics,
        kinds: Vec<ReportKind>,
    ) -> Self {
        let cache = ReportCache::new(
            Arc::new(CacheStore::new(store_config, cache_metrics)),
            Arc::new(CounterRegistry::default()),
        );
        let clusters = Arc::new(ClusterRegistry::new(cache.clone(), cluster_config));
        let details = Arc::new(DetailRefreshCoordinator::new(
            cache.clone(),
            clusters.clone(),
            kinds.clone(),
            detail_config,
            metrics.clone(),
        ));
        Self {
            cache,
            clusters,
            details,
            mirrors: MirrorSet::default(),
            kinds,
            metrics,
        }
    }

    pub fn cache(&self) -> &ReportCache {
        &self.cache
    }

    /// The interface exposed to request handlers.
    pub fn service(&self) -> Arc<dyn CacheService> {
        Arc::new(self.cache.clone())
    }

    pub fn clusters(&self) -> &Arc<ClusterRegistry> {
        &self.clusters
    }

    pub fn details(&self) -> &Arc<DetailRefreshCoordinator> {
        &self.details
    }

    pub fn mirrors(&self) -> &MirrorSet {
        &self.mirrors
    }

    /// Loads the persisted snapshot, if persistence is configured.
    pub fn load(&self) -> Result<Option<LoadSummary>, PersistError> {
        if self.cache.store().config().path.is_none() {
            debug!("Cache persistence disabled");
            return Ok(None);
        }
        self.cache.load().map(Some)
    }

    pub fn sweeper(&self, config: SweepConfig) -> ReconciliationSweeper {
        ReconciliationSweeper::new(
            self.cache.clone(),
            self.mirrors.clone(),
            config,
            self.metrics.clone(),
        )
    }

    /// Onboards a cluster and runs its watches until shutdown.
    ///
    /// Watches that fail to start are retried every `refresh_interval`, which
    /// also paces namespace refreshes once the watches run.
    pub async fn run_cluster(
        self,
        name: String,
        client: kube::Client,
        url: String,
        config: InformerConfig,
        refresh_interval: Duration,
        shutdown: drain::Watch,
    ) {
        let api = Arc::new(KubeClusterApi::new(client.clone(), url));
        self.clusters.set_cluster_client(&name, api).await;

        let handler = ReportHandler::new(&name, Arc::new(self.cache.clone()));
        let informers = Arc::new(InformerManager::new(
            client,
            self.kinds.clone(),
            handler,
            config,
            self.metrics.clone(),
        ));

        tokio::pin! {
            let shutdown = shutdown.signaled();
        }
        loop {
            match informers.start().await {
                Ok(_) => break,
                Err(error) => warn!(%error, "Failed to start report watches"),
            }
            tokio::select! {
                release = &mut shutdown => {
                    drop(release);
                    return;
                }
                _ = time::sleep(refresh_interval) => {}
            }
        }
        self.mirrors.insert(name.clone(), informers.clone());

        let mut refresh =
            time::interval_at(time::Instant::now() + refresh_interval, refresh_interval);
        refresh.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                release = &mut shutdown => {
                    self.mirrors.remove(&name);
                    informers.stop().await;
                    drop(release);
                    return;
                }
                _ = refresh.tick() => {
                    if let Some(namespaces) = self.clusters.refresh_namespaces(&name).await {
                        debug!(namespaces = namespaces.len(), "Refreshed namespaces");
                    }
                }
            }
        }
    }

    /// Purges expired entries and saves the cache every `interval`, and once
    /// more on shutdown.
    pub async fn persist(self, interval: Duration, shutdown: drain::Watch) {
        tokio::pin! {
            let shutdown = shutdown.signaled();
        }
        let mut ticks = time::interval_at(time::Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                release = &mut shutdown => {
                    self.save().await;
                    drop(release);
                    return;
                }
                _ = ticks.tick() => {
                    self.cache.store().purge_expired();
                    self.save().await;
                }
            }
        }
    }

    async fn save(&self) {
        if self.cache.store().config().path.is_none() {
            return;
        }
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.save()).await {
            Ok(Ok(summary)) => {
                debug!(saved = summary.saved, expired = summary.expired, "Saved cache")
            }
            Ok(Err(error)) => warn!(%error, "Failed to save cache"),
            Err(error) => warn!(%error, "Cache save task failed"),
        }
    }
}
