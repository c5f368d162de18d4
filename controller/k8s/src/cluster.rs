use crate::kinds::api_resource;
use ahash::AHashMap as HashMap;
use anyhow::Result;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, DynamicObject, ListParams},
    ResourceExt,
};
use parking_lot::RwLock;
use report_cache_controller_core::{
    key::namespace_prefix, kinds::ReportKind, CacheKey, CacheService, CacheValue, ClusterRecord,
    NamespaceRecord,
};
use report_cache_controller_store::ReportCache;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

/// The operations the controller performs against a cluster's API server
/// outside of its watches.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    fn api_server_url(&self) -> String;

    async fn version(&self) -> Result<String>;

    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// Fetches a single report object. Cluster-scoped kinds ignore the
    /// namespace.
    async fn get_report(
        &self,
        kind: &ReportKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>>;
}

/// A [`ClusterApi`] backed by a Kubernetes client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: kube::Client,
    url: String,
}

/// A registered cluster and the namespaces it was last known to have.
#[derive(Clone)]
pub struct ClusterClient {
    pub name: String,
    pub api_server_url: String,
    pub version: String,
    pub namespaces: Vec<String>,
    pub api: Arc<dyn ClusterApi>,
}

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub namespace_timeout: Duration,
    pub cluster_ttl: Duration,
    pub namespace_ttl: Duration,
}

/// Tracks the clients of every onboarded cluster.
pub struct ClusterRegistry {
    clients: RwLock<HashMap<String, Arc<ClusterClient>>>,
    cache: ReportCache,
    config: ClusterConfig,
}

// === impl KubeClusterApi ===

impl KubeClusterApi {
    pub fn new(client: kube::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeClusterApi {
    fn api_server_url(&self) -> String {
        self.url.clone()
    }

    async fn version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api = Api::<Namespace>::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn get_report(
        &self,
        kind: &ReportKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>> {
        let ar = api_resource(kind);
        let api = if kind.namespaced {
            Api::<DynamicObject>::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::<DynamicObject>::all_with(self.client.clone(), &ar)
        };
        let obj = api.get_opt(name).await?;
        Ok(obj.map(serde_json::to_value).transpose()?)
    }
}

// === impl ClusterClient ===

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("name", &self.name)
            .field("api_server_url", &self.api_server_url)
            .field("version", &self.version)
            .field("namespaces", &self.namespaces.len())
            .finish()
    }
}

// === impl ClusterConfig ===

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace_timeout: Duration::from_secs(10),
            cluster_ttl: Duration::from_secs(5 * 60),
            namespace_ttl: Duration::from_secs(5 * 60),
        }
    }
}

// === impl ClusterRegistry ===

impl ClusterRegistry {
    pub fn new(cache: ReportCache, config: ClusterConfig) -> Self {
        Self {
            clients: Default::default(),
            cache,
            config,
        }
    }

    /// Registers a cluster, replacing any previous client of the same name.
    ///
    /// Namespaces are listed from the API server. When that fails or yields
    /// nothing, they are recovered from the cached namespace entries so that
    /// a cluster whose API is briefly unreachable keeps its namespace list.
    pub async fn set_cluster_client(
        &self,
        name: &str,
        api: Arc<dyn ClusterApi>,
    ) -> Arc<ClusterClient> {
        let version = match time::timeout(self.config.namespace_timeout, api.version()).await {
            Ok(Ok(version)) => version,
            Ok(Err(error)) => {
                warn!(cluster = %name, %error, "Failed to get API server version");
                String::new()
            }
            Err(_) => {
                warn!(cluster = %name, "Timed out getting API server version");
                String::new()
            }
        };
        let namespaces = self.discover_namespaces(name, &*api).await;

        let client = Arc::new(ClusterClient {
            name: name.to_string(),
            api_server_url: api.api_server_url(),
            version,
            namespaces,
            api,
        });
        self.write_metadata(&client);
        self.clients
            .write()
            .insert(name.to_string(), client.clone());
        info!(
            cluster = %name,
            url = %client.api_server_url,
            version = %client.version,
            namespaces = client.namespaces.len(),
            "Registered cluster"
        );
        client
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusterClient>> {
        self.clients.read().get(name).cloned()
    }

    /// Forgets a cluster along with its cached metadata, reports and
    /// counters.
    pub fn remove(&self, name: &str) -> Option<Arc<ClusterClient>> {
        let removed = self.clients.write().remove(name);
        if removed.is_some() {
            self.cache.delete(&CacheKey::cluster(name).to_string());
            for (key, _) in self.cache.store().namespace_entries(name) {
                self.cache.delete(&key);
            }
            let reports = self.cache.remove_cluster(name);
            debug!(cluster = %name, reports, "Removed cluster");
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.clients.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Re-lists a registered cluster's namespaces and renews its cached
    /// metadata.
    pub async fn refresh_namespaces(&self, name: &str) -> Option<Vec<String>> {
        let current = self.get(name)?;
        let namespaces = self.discover_namespaces(name, &*current.api).await;
        let client = Arc::new(ClusterClient {
            namespaces: namespaces.clone(),
            ..(*current).clone()
        });
        self.write_metadata(&client);

        // The cluster may have been removed or replaced while listing.
        let mut clients = self.clients.write();
        match clients.get_mut(name) {
            Some(entry) if Arc::ptr_eq(entry, &current) => *entry = client,
            _ => return None,
        }
        drop(clients);
        Some(namespaces)
    }

    async fn discover_namespaces(&self, name: &str, api: &dyn ClusterApi) -> Vec<String> {
        match time::timeout(self.config.namespace_timeout, api.list_namespaces()).await {
            Ok(Ok(mut namespaces)) if !namespaces.is_empty() => {
                namespaces.sort();
                namespaces.dedup();
                return namespaces;
            }
            Ok(Ok(_)) => warn!(cluster = %name, "Cluster listed no namespaces"),
            Ok(Err(error)) => warn!(cluster = %name, %error, "Failed to list namespaces"),
            Err(_) => warn!(
                cluster = %name,
                timeout = ?self.config.namespace_timeout,
                "Timed out listing namespaces"
            ),
        }

        let recovered = self.cached_namespaces(name);
        info!(
            cluster = %name,
            namespaces = recovered.len(),
            "Recovered namespaces from cache"
        );
        recovered
    }

    fn cached_namespaces(&self, name: &str) -> Vec<String> {
        let prefix = namespace_prefix(name);
        let mut namespaces = self
            .cache
            .store()
            .namespace_entries(name)
            .into_iter()
            .filter_map(|(key, value)| {
                value
                    .namespace_name()
                    .map(str::to_string)
                    .or_else(|| key.strip_prefix(&prefix).map(str::to_string))
            })
            .filter(|ns| !ns.is_empty())
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    fn write_metadata(&self, client: &ClusterClient) {
        let record = ClusterRecord {
            name: client.name.clone(),
            api_server_url: client.api_server_url.clone(),
            version: client.version.clone(),
            namespaces: client.namespaces.clone(),
        };
        self.cache.set(
            &CacheKey::cluster(&client.name).to_string(),
            CacheValue::Cluster(record),
            Some(self.config.cluster_ttl),
        );
        for ns in &client.namespaces {
            self.cache.set(
                &CacheKey::namespace(&client.name, ns).to_string(),
                CacheValue::Namespace(NamespaceRecord {
                    cluster: client.name.clone(),
                    name: ns.clone(),
                }),
                Some(self.config.namespace_ttl),
            );
        }
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("clusters", &self.names())
            .finish()
    }
}
