use crate::Controller;
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use report_cache_controller_k8s::{
    kinds, ClusterConfig, DetailConfig, InformerConfig, SweepConfig, SyncMetrics,
};
use report_cache_controller_store::{CacheMetrics, StoreConfig};
use std::{path::PathBuf, time::Duration};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "report-cache", about = "Caches security reports from many clusters")]
pub struct Args {
    #[clap(
        long,
        default_value = "report_cache_controller=info,warn",
        env = "REPORT_CACHE_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name under which the cluster of the default client is cached.
    #[clap(long, default_value = "local", env = "REPORT_CACHE_CLUSTER_NAME")]
    cluster_name: String,

    /// Kubeconfig contexts of additional clusters to watch.
    #[clap(long, value_delimiter = ',')]
    remote_contexts: Vec<String>,

    /// Restricts watches of namespaced report kinds to these namespaces.
    #[clap(long, value_delimiter = ',')]
    watch_namespaces: Option<Vec<String>>,

    /// Where the cache is persisted. Persistence is disabled when unset.
    #[clap(long, env = "REPORT_CACHE_FILE")]
    cache_file: Option<PathBuf>,

    #[clap(long, default_value = "60")]
    persist_interval_secs: u64,

    /// The ceiling on the estimated size of hot cache entries.
    #[clap(long, default_value = "268435456")]
    max_cost_bytes: u64,

    #[clap(long, default_value = "300")]
    cluster_ttl_secs: u64,

    #[clap(long, default_value = "300")]
    namespace_ttl_secs: u64,

    #[clap(long, default_value = "86400")]
    report_ttl_secs: u64,

    #[clap(long, default_value = "1800")]
    detail_ttl_secs: u64,

    #[clap(long, default_value = "300")]
    detail_jitter_secs: u64,

    #[clap(long, default_value = "15")]
    fetch_timeout_secs: u64,

    #[clap(long, default_value = "30")]
    sync_timeout_secs: u64,

    #[clap(long, default_value = "600")]
    resync_interval_secs: u64,

    #[clap(long, default_value = "300")]
    reconcile_interval_secs: u64,

    #[clap(long, default_value = "100")]
    reconcile_batch_size: usize,

    #[clap(long, default_value = "300")]
    namespace_refresh_interval_secs: u64,

    #[clap(long, default_value = "10")]
    namespace_timeout_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let mut prom = <Registry>::default();
        let cache_metrics = CacheMetrics::register(prom.sub_registry_with_prefix("report_cache"));
        let sync_metrics = SyncMetrics::register(prom.sub_registry_with_prefix("report_sync"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let store_config = self.store_config();
        let cluster_config = self.cluster_config();
        let informer_config = self.informer_config();
        let detail_config = self.detail_config();
        let sweep_config = self.sweep_config();
        let persist_interval = secs(self.persist_interval_secs);
        let reconcile_interval = secs(self.reconcile_interval_secs);
        let namespace_refresh_interval = secs(self.namespace_refresh_interval_secs);

        let Self {
            log_level,
            log_format,
            client,
            admin,
            cluster_name,
            remote_contexts,
            ..
        } = self;

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let kinds = kinds::discover(&runtime.client()).await;
        info!(kinds = kinds.len(), "Watching report kinds");

        let controller = Controller::new(
            store_config,
            cache_metrics,
            cluster_config,
            detail_config,
            sync_metrics,
            kinds,
        );
        match controller.load() {
            Ok(Some(summary)) if summary.corrupt => warn!("Started with an empty cache"),
            Ok(_) => {}
            Err(error) => warn!(%error, "Failed to load cache snapshot"),
        }

        let local_url = match kube::Config::infer().await {
            Ok(config) => config.cluster_url.to_string(),
            Err(_) => String::new(),
        };
        let mut clusters = vec![(cluster_name, runtime.client(), local_url)];
        for context in remote_contexts {
            match remote_client(&context).await {
                Ok((client, url)) => clusters.push((context, client, url)),
                Err(error) => warn!(%context, %error, "Skipping cluster"),
            }
        }

        for (name, client, url) in clusters {
            let controller = controller.clone();
            let config = informer_config.clone();
            let shutdown = runtime.shutdown_handle();
            let span = info_span!("cluster", cluster = %name);
            tokio::spawn(
                async move {
                    controller
                        .run_cluster(
                            name,
                            client,
                            url,
                            config,
                            namespace_refresh_interval,
                            shutdown,
                        )
                        .await
                }
                .instrument(span),
            );
        }

        tokio::spawn(
            controller
                .sweeper(sweep_config)
                .run(reconcile_interval, runtime.shutdown_handle())
                .instrument(info_span!("reconcile")),
        );

        tokio::spawn(
            controller
                .clone()
                .persist(persist_interval, runtime.shutdown_handle())
                .instrument(info_span!("persist")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.cache_file.clone(),
            max_cost: self.max_cost_bytes,
            default_ttl: secs(self.cluster_ttl_secs),
            report_ttl: secs(self.report_ttl_secs),
        }
    }

    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            namespace_timeout: secs(self.namespace_timeout_secs),
            cluster_ttl: secs(self.cluster_ttl_secs),
            namespace_ttl: secs(self.namespace_ttl_secs),
        }
    }

    fn informer_config(&self) -> InformerConfig {
        InformerConfig {
            sync_timeout: secs(self.sync_timeout_secs),
            resync_interval: secs(self.resync_interval_secs),
            namespaces: self.watch_namespaces.clone().filter(|ns| !ns.is_empty()),
        }
    }

    fn detail_config(&self) -> DetailConfig {
        DetailConfig {
            ttl: secs(self.detail_ttl_secs),
            jitter: secs(self.detail_jitter_secs),
            fetch_timeout: secs(self.fetch_timeout_secs),
        }
    }

    fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            batch_size: self.reconcile_batch_size,
            ..Default::default()
        }
    }
}

async fn remote_client(context: &str) -> Result<(kube::Client, String)> {
    let options = kube::config::KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = kube::Config::from_kubeconfig(&options).await?;
    let url = config.cluster_url.to_string();
    let client = kube::Client::try_from(config)?;
    Ok((client, url))
}

/// Intervals are clamped to at least a second; tokio intervals may not be
/// zero.
fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["report-cache"]).expect("args must parse");
        assert_eq!(args.cluster_name, "local");
        assert!(args.remote_contexts.is_empty());

        let store = args.store_config();
        assert_eq!(store.path, None);
        assert_eq!(store.max_cost, 256 * 1024 * 1024);
        assert_eq!(store.report_ttl, Duration::from_secs(24 * 60 * 60));

        let informer = args.informer_config();
        assert_eq!(informer.sync_timeout, Duration::from_secs(30));
        assert_eq!(informer.resync_interval, Duration::from_secs(10 * 60));
        assert_eq!(informer.namespaces, None);

        let detail = args.detail_config();
        assert_eq!(detail.ttl, Duration::from_secs(30 * 60));
        assert_eq!(detail.jitter, Duration::from_secs(5 * 60));
        assert_eq!(detail.fetch_timeout, Duration::from_secs(15));

        assert_eq!(args.sweep_config().batch_size, 100);
        assert_eq!(args.cluster_config().namespace_timeout, Duration::from_secs(10));
    }

    #[test]
    fn lists_are_comma_delimited() {
        let args = Args::try_parse_from([
            "report-cache",
            "--remote-contexts=east,west",
            "--watch-namespaces=apps,payments",
            "--cache-file=/var/cache/reports.json",
        ])
        .expect("args must parse");
        assert_eq!(args.remote_contexts, vec!["east", "west"]);
        assert_eq!(
            args.informer_config().namespaces,
            Some(vec!["apps".to_string(), "payments".to_string()])
        );
        assert_eq!(
            args.store_config().path,
            Some(PathBuf::from("/var/cache/reports.json"))
        );
    }
}
