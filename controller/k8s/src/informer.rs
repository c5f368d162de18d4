use crate::{
    handler::ReportHandler,
    kinds::api_resource,
    metrics::SyncMetrics,
    sweeper::{Mirror, Presence},
};
use ahash::AHashMap as HashMap;
use futures::prelude::*;
use kube::{
    api::{Api, DynamicObject},
    discovery::ApiResource,
    runtime::{
        reflector::{store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
};
use parking_lot::{Mutex, RwLock};
use report_cache_controller_core::{kinds::ReportKind, ReportKey};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, time};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    Created,
    Syncing,
    Synced,
    /// The initial listing did not complete in time. The watch keeps running
    /// and the kind becomes `Synced` once its mirror is ready.
    SyncTimedOut,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no report kinds synced in cluster {cluster} within {timeout:?}")]
    NoKindsSynced { cluster: String, timeout: Duration },

    #[error("no report kinds to watch in cluster {0}")]
    NoKinds(String),

    #[error("watches already running in cluster {0}")]
    AlreadyStarted(String),
}

#[derive(Clone, Debug)]
pub struct InformerConfig {
    pub sync_timeout: Duration,
    pub resync_interval: Duration,
    /// Restricts watches of namespaced kinds to these namespaces, for
    /// clusters where the controller may not list reports cluster-wide.
    pub namespaces: Option<Vec<String>>,
}

/// Runs the report watches of a single cluster.
///
/// Each report kind is watched by one or more watchers, each feeding a
/// reflector store that mirrors the cluster's objects. Every event is passed
/// to the [`ReportHandler`]; the mirrors are used to warm the cache once
/// synced, to periodically replay objects into it, and by reconciliation to
/// find cached reports that no longer exist.
pub struct InformerManager {
    cluster: String,
    client: kube::Client,
    kinds: Vec<ReportKind>,
    handler: ReportHandler,
    config: InformerConfig,
    metrics: SyncMetrics,
    informers: RwLock<HashMap<String, Arc<Informer>>>,
    shutdown: Mutex<Option<drain::Signal>>,
}

/// The watches of one report kind.
struct Informer {
    kind: ReportKind,
    resource: ApiResource,
    stores: Vec<Store<DynamicObject>>,
    state: watch::Sender<SyncState>,
}

// === impl InformerConfig ===

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(30),
            resync_interval: Duration::from_secs(10 * 60),
            namespaces: None,
        }
    }
}

// === impl InformerManager ===

impl InformerManager {
    pub fn new(
        client: kube::Client,
        kinds: Vec<ReportKind>,
        handler: ReportHandler,
        config: InformerConfig,
        metrics: SyncMetrics,
    ) -> Self {
        let informers = kinds
            .iter()
            .map(|kind| (kind.name.clone(), Arc::new(Informer::idle(kind.clone()))))
            .collect();
        Self {
            cluster: handler.cluster().to_string(),
            client,
            kinds,
            handler,
            config,
            metrics,
            informers: RwLock::new(informers),
            shutdown: Mutex::new(None),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn kinds(&self) -> &[ReportKind] {
        &self.kinds
    }

    pub fn sync_states(&self) -> HashMap<String, SyncState> {
        self.informers
            .read()
            .iter()
            .map(|(name, informer)| (name.clone(), informer.state()))
            .collect()
    }

    /// Starts a watch for every report kind and waits for the mirrors to sync.
    ///
    /// Kinds that do not sync within the configured timeout keep running in
    /// the background. Fails, stopping every watch, only if no kind synced.
    /// Returns the number of synced kinds.
    pub async fn start(&self) -> Result<usize, Error> {
        if self.kinds.is_empty() {
            return Err(Error::NoKinds(self.cluster.clone()));
        }
        let (signal, drain) = drain::channel();
        {
            let mut shutdown = self.shutdown.lock();
            if shutdown.is_some() {
                return Err(Error::AlreadyStarted(self.cluster.clone()));
            }
            *shutdown = Some(signal);
        }

        let informers = self
            .kinds
            .iter()
            .map(|kind| (kind.name.clone(), self.spawn_informer(kind, &drain)))
            .collect::<HashMap<_, _>>();
        *self.informers.write() = informers.clone();

        let timeout = self.config.sync_timeout;
        let ready = future::join_all(informers.into_values().map(|informer| async move {
            let ready = time::timeout(timeout, informer.ready())
                .await
                .unwrap_or(false);
            (informer, ready)
        }))
        .await;

        let mut synced = 0;
        for (informer, ready) in ready {
            if ready && informer.promote(SyncState::Syncing) {
                let objects = informer.replay(&self.handler);
                debug!(kind = %informer.kind.name, objects, "Warmed cache from mirror");
                synced += 1;
            } else {
                informer.state.send_replace(SyncState::SyncTimedOut);
                warn!(
                    cluster = %self.cluster,
                    kind = %informer.kind.name,
                    ?timeout,
                    "Report kind did not sync in time"
                );
                self.spawn_late_sync(informer, drain.clone());
            }
        }
        drop(drain);
        self.metrics.set_synced_kinds(&self.cluster, synced);

        if synced == 0 {
            self.stop().await;
            return Err(Error::NoKindsSynced {
                cluster: self.cluster.clone(),
                timeout,
            });
        }
        info!(cluster = %self.cluster, synced, kinds = self.kinds.len(), "Watches synced");
        Ok(synced)
    }

    /// Stops every watch and drops the mirrors.
    pub async fn stop(&self) {
        let Some(signal) = self.shutdown.lock().take() else {
            return;
        };
        for informer in self.informers.read().values() {
            informer.state.send_replace(SyncState::Stopped);
        }
        signal.drain().await;

        let mut informers = self.informers.write();
        for informer in informers.values_mut() {
            *informer = Arc::new(Informer::stopped(informer.kind.clone()));
        }
        drop(informers);
        self.metrics.set_synced_kinds(&self.cluster, 0);
        debug!(cluster = %self.cluster, "Watches stopped");
    }

    fn spawn_informer(&self, kind: &ReportKind, drain: &drain::Watch) -> Arc<Informer> {
        let resource = api_resource(kind);
        let apis = match (&self.config.namespaces, kind.namespaced) {
            (Some(namespaces), true) => namespaces
                .iter()
                .map(|ns| {
                    Api::<DynamicObject>::namespaced_with(self.client.clone(), ns, &resource)
                })
                .collect::<Vec<_>>(),
            _ => vec![Api::<DynamicObject>::all_with(self.client.clone(), &resource)],
        };

        let mut stores = Vec::with_capacity(apis.len());
        for api in apis {
            let writer = Writer::<DynamicObject>::new(resource.clone());
            let store = writer.as_reader();
            let events = watcher(api, watcher::Config::default())
                .default_backoff()
                .reflect(writer);
            let watch = Watch {
                kind: kind.clone(),
                handler: self.handler.clone(),
                metrics: self.metrics.clone(),
                store: store.clone(),
                resync_interval: self.config.resync_interval,
            };
            tokio::spawn(
                watch
                    .run(events, drain.clone())
                    .instrument(info_span!("watch", cluster = %self.cluster, kind = %kind.name)),
            );
            stores.push(store);
        }

        let (state, _) = watch::channel(SyncState::Syncing);
        Arc::new(Informer {
            kind: kind.clone(),
            resource,
            stores,
            state,
        })
    }

    fn spawn_late_sync(&self, informer: Arc<Informer>, drain: drain::Watch) {
        let handler = self.handler.clone();
        let span = info_span!("sync", cluster = %self.cluster, kind = %informer.kind.name);
        tokio::spawn(
            async move {
                tokio::select! {
                    ready = informer.ready() => {
                        if ready && informer.promote(SyncState::SyncTimedOut) {
                            let objects = informer.replay(&handler);
                            info!(objects, "Report kind synced");
                        }
                    }
                    release = drain.signaled() => drop(release),
                }
            }
            .instrument(span),
        );
    }
}

impl Mirror for InformerManager {
    fn lookup(&self, key: &ReportKey) -> Presence {
        let informer = match self.informers.read().get(&key.kind) {
            Some(informer) => informer.clone(),
            None => return Presence::Unknown,
        };
        if informer.state() != SyncState::Synced {
            return Presence::Unknown;
        }
        if informer.contains(&key.namespace, &key.name) {
            Presence::Present
        } else {
            Presence::Absent
        }
    }
}

impl std::fmt::Debug for InformerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InformerManager")
            .field("cluster", &self.cluster)
            .field("kinds", &self.kinds.len())
            .finish()
    }
}

// === impl Informer ===

impl Informer {
    fn idle(kind: ReportKind) -> Self {
        Self::without_watches(kind, SyncState::Created)
    }

    fn stopped(kind: ReportKind) -> Self {
        Self::without_watches(kind, SyncState::Stopped)
    }

    fn without_watches(kind: ReportKind, state: SyncState) -> Self {
        Self {
            resource: api_resource(&kind),
            kind,
            stores: Vec::new(),
            state: watch::channel(state).0,
        }
    }

    fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Completes when every mirror has finished its initial listing. Returns
    /// false if a watch ended first.
    async fn ready(&self) -> bool {
        future::try_join_all(self.stores.iter().map(|store| store.wait_until_ready()))
            .await
            .is_ok()
    }

    /// Moves the informer to `Synced` if it is still in state `from`.
    fn promote(&self, from: SyncState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = SyncState::Synced;
                return true;
            }
            false
        })
    }

    fn replay(&self, handler: &ReportHandler) -> usize {
        self.stores
            .iter()
            .map(|store| replay(&self.kind, handler, store))
            .sum()
    }

    /// Namespaced kinds are looked up directly; cluster-scoped kinds are
    /// scanned by name.
    fn contains(&self, namespace: &str, name: &str) -> bool {
        if self.kind.namespaced {
            let obj = ObjectRef::new_with(name, self.resource.clone()).within(namespace);
            return self.stores.iter().any(|store| store.get(&obj).is_some());
        }
        self.stores.iter().any(|store| {
            store
                .state()
                .iter()
                .any(|obj| obj.metadata.name.as_deref() == Some(name))
        })
    }
}

/// A single watch of one report kind, in one namespace or cluster-wide.
struct Watch {
    kind: ReportKind,
    handler: ReportHandler,
    metrics: SyncMetrics,
    store: Store<DynamicObject>,
    resync_interval: Duration,
}

// === impl Watch ===

impl Watch {
    async fn run<S>(self, events: S, drain: drain::Watch)
    where
        S: Stream<Item = Result<watcher::Event<DynamicObject>, watcher::Error>>,
    {
        tokio::pin! {
            let events = events;
            let shutdown = drain.signaled();
        }
        let mut resync = time::interval_at(
            time::Instant::now() + self.resync_interval,
            self.resync_interval,
        );
        resync.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                release = &mut shutdown => {
                    drop(release);
                    debug!("Watch stopped");
                    return;
                }
                _ = resync.tick() => {
                    let objects = replay(&self.kind, &self.handler, &self.store);
                    debug!(objects, "Resynced");
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(error)) => {
                        self.metrics.watch_error(self.handler.cluster(), &self.kind.name);
                        info!(%error, "Watch failed");
                    }
                    None => {
                        warn!("Watch ended");
                        return;
                    }
                },
            }
        }
    }

    fn handle(&self, event: watcher::Event<DynamicObject>) {
        let name = match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                self.handler.apply(&self.kind, &obj);
                "apply"
            }
            watcher::Event::Delete(obj) => {
                self.handler.delete(&self.kind, &obj);
                "delete"
            }
            watcher::Event::Init => {
                debug!("Listing");
                "init"
            }
            watcher::Event::InitDone => {
                debug!("Listed");
                "init_done"
            }
        };
        self.metrics
            .watch_event(self.handler.cluster(), &self.kind.name, name);
    }
}

/// Passes every mirrored object through the handler. Applying an unchanged
/// object is a no-op, so replays are safe at any time.
fn replay(kind: &ReportKind, handler: &ReportHandler, store: &Store<DynamicObject>) -> usize {
    let objects = store.state();
    for obj in &objects {
        handler.apply(kind, obj);
    }
    objects.len()
}
