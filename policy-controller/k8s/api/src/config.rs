use crate::GvkEntry;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster-wide controller configuration: which kinds are replicated into the
/// policy engine's data cache and which namespaces each process ignores.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.gatekeeper.sh",
    version = "v1alpha1",
    kind = "Config",
    namespaced,
    status = "ConfigStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    #[serde(default)]
    pub sync: SyncSpec,

    #[serde(default, rename = "match")]
    pub matches: Vec<MatchEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    /// Kinds to watch and replicate.
    #[serde(default)]
    pub sync_only: Vec<GvkEntry>,
}

/// Excludes namespaces from one or more processes (`audit`, `sync`,
/// `webhook`, `mutation-webhook`, or `*`).
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchEntry {
    #[serde(default)]
    pub excluded_namespaces: Vec<String>,

    #[serde(default)]
    pub processes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStatus {
    /// Every kind whose instances may still carry the sync finalizer. A kind
    /// stays listed until finalizer cleanup confirms none remain.
    #[serde(default)]
    pub all_finalizers: Vec<GvkEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_config_spec() {
        let spec = serde_json::from_value::<ConfigSpec>(serde_json::json!({
            "sync": {
                "syncOnly": [
                    { "version": "v1", "kind": "Pod" },
                    { "group": "apps", "version": "v1", "kind": "Deployment" },
                ],
            },
            "match": [
                { "excludedNamespaces": ["kube-*"], "processes": ["*"] },
            ],
        }))
        .expect("spec must parse");

        assert_eq!(
            spec.sync.sync_only,
            vec![
                GvkEntry::new("", "v1", "Pod"),
                GvkEntry::new("apps", "v1", "Deployment"),
            ]
        );
        assert_eq!(
            spec.matches,
            vec![MatchEntry {
                excluded_namespaces: vec!["kube-*".to_string()],
                processes: vec!["*".to_string()],
            }]
        );
    }

    #[test]
    fn empty_spec_defaults() {
        let spec = serde_json::from_value::<ConfigSpec>(serde_json::json!({}))
            .expect("spec must parse");
        assert_eq!(spec, ConfigSpec::default());
    }
}
