//! Kubernetes integration for the report cache.
//!
//! - [`ClusterRegistry`] tracks onboarded clusters and their namespaces.
//! - [`InformerManager`] watches every report kind of a cluster, writing
//!   summaries into the cache through a [`ReportHandler`].
//! - [`ReconciliationSweeper`] removes cached reports that the watches no
//!   longer see.
//! - [`DetailRefreshCoordinator`] fetches full report objects on demand.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod detail;
pub mod handler;
pub mod informer;
pub mod kinds;
mod metrics;
pub mod sweeper;


pub use self::{
    cluster::{ClusterApi, ClusterClient, ClusterConfig, ClusterRegistry, KubeClusterApi},
    detail::{DetailConfig, DetailLookup, DetailRefreshCoordinator, RefreshOutcome},
    handler::ReportHandler,
    informer::{InformerConfig, InformerManager, SyncState},
    metrics::SyncMetrics,
    sweeper::{
        Mirror, MirrorSet, Presence, ReconciliationSweeper, SweepConfig, SweepSummary,
    },
};
