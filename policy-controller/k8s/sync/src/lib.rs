#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Keeps the set of watched kinds equal to the union of what every watch
//! source requests, and mirrors the objects of those kinds into the policy
//! engine's data cache.
//!
//! Sources are the singleton `Config` ([`ConfigReconciler`]) and each
//! `SyncSet` ([`SyncSetReconciler`]). Both funnel into the [`CacheManager`],
//! which aggregates their requests, drives the watch registrar, and loads or
//! evicts cached data as kinds come and go. Watch events reach the cache
//! through a bounded queue ([`events`]) drained by the [`SyncHandler`].

pub mod aggregator;
pub mod cache;
mod config;
mod dynamic;
mod error;
pub mod events;
pub mod excluder;
pub mod finalizers;
mod handler;
mod inventory;
mod metrics;
pub mod readiness;
mod syncset;


pub use self::{
    aggregator::{GvkAggregator, SourceKey, SourceKind},
    cache::CacheManager,
    config::ConfigReconciler,
    error::{Error, WatchFailures},
    events::{EventKind, EventReceiver, EventSender, SyncEvent, EVENT_QUEUE_CAPACITY},
    excluder::{Process, ProcessExcluder},
    finalizers::{CleanupState, CleanupStatus, FinalizerCleanup},
    handler::SyncHandler,
    inventory::Inventory,
    metrics::SyncMetrics,
    readiness::ReadinessTracker,
    syncset::SyncSetReconciler,
};
