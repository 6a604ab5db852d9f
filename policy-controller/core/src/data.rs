use gatekeeper_policy_controller_k8s_api::DynamicObject;
use std::collections::BTreeMap;

/// What to remove from the policy engine's data cache.
#[derive(Clone, Debug)]
pub enum RemoveTarget {
    Object(DynamicObject),
    /// Drops every cached object of every kind.
    WipeAll,
}

/// Reports which of the engine's data targets handled a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Responses {
    pub handled: BTreeMap<String, bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("object has no type information")]
    MissingType,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The policy engine's replicated-data interface.
#[async_trait::async_trait]
pub trait DataClient: Send + Sync {
    /// Adds or replaces an object in the engine's cache.
    async fn add_data(&self, obj: &DynamicObject) -> Result<Responses, DataError>;

    async fn remove_data(&self, target: &RemoveTarget) -> Result<Responses, DataError>;
}

// === impl Responses ===

impl Responses {
    pub fn handled_by(target: impl Into<String>) -> Self {
        Self {
            handled: Some((target.into(), true)).into_iter().collect(),
        }
    }

    /// Names the targets that declined the request.
    pub fn unhandled(&self) -> impl Iterator<Item = &str> {
        self.handled
            .iter()
            .filter(|(_, handled)| !**handled)
            .map(|(target, _)| target.as_str())
    }
}
