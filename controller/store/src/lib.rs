//! The report cache.
//!
//! [`CacheStore`] holds every cached entry in an authoritative map with secondary indices, fronted
//! by a bounded layer that keeps hot entries within a cost ceiling. [`CounterRegistry`] holds
//! aggregate report counts, so that count queries never walk the cache. [`ReportCache`] couples
//! the two and implements the [`CacheService`](report_cache_controller_core::CacheService) and
//! [`CacheUpdater`](report_cache_controller_core::CacheUpdater) interfaces.
//!
//! The store and the counters each own an independent lock. No caller holds one while acquiring
//! the other.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod counters;
mod metrics;
mod persist;
mod store;
mod weigh;

#[cfg(test)]
mod tests;

pub use self::{
    cache::ReportCache,
    counters::{CountedReport, CounterRegistry},
    metrics::CacheMetrics,
    persist::{LoadSummary, PersistError, SaveSummary},
    store::{CacheEntry, CacheStore, StoreConfig},
};
