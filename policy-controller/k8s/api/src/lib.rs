#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
mod gvk;
pub mod syncset;

pub use self::{
    config::{Config, ConfigSpec, ConfigStatus, MatchEntry, SyncSpec},
    gvk::GvkEntry,
    syncset::{SyncSet, SyncSetSpec},
};
pub use k8s_openapi::{api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::Time};
pub use kube::{
    core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta},
    Resource, ResourceExt,
};

/// Held by `Config` and `SyncSet` objects for as long as they contribute kinds
/// to the watched set.
pub const SOURCE_FINALIZER: &str = "finalizers.gatekeeper.sh/sync-source";

/// Applied to synced objects when object finalization is enabled.
pub const SYNC_FINALIZER: &str = "finalizers.gatekeeper.sh/sync";

/// Older releases placed this finalizer on the `Config` itself. It is stripped
/// whenever the `Config` is read.
pub const LEGACY_CONFIG_FINALIZER: &str = "finalizers.gatekeeper.sh/config";

/// The controller only acts on the `Config` with this name.
pub const CONFIG_NAME: &str = "config";
