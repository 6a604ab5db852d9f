use crate::GvkEntry;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Contributes additional kinds to the watched set without editing the
/// singleton `Config`.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "syncset.gatekeeper.sh", version = "v1alpha1", kind = "SyncSet")]
#[serde(rename_all = "camelCase")]
pub struct SyncSetSpec {
    #[serde(default)]
    pub gvks: Vec<GvkEntry>,
}
