use crate::{Gvk, ObjectKey};
use gatekeeper_policy_controller_k8s_api::DynamicObject;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{gvk} {key} not found")]
    NotFound { gvk: Gvk, key: ObjectKey },

    /// The API server does not serve the kind.
    #[error("no matches for kind {0}")]
    NoMatch(Gvk),

    #[error("conflicting write to {gvk} {key}")]
    Conflict { gvk: Gvk, key: ObjectKey },

    #[error("object has no type information")]
    MissingType,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Reads objects from the Kubernetes API.
#[async_trait::async_trait]
pub trait Reader: Send + Sync {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<DynamicObject, ClientError>;

    /// Lists every object of the given kind across all namespaces. Listed
    /// objects carry their type information.
    async fn list(&self, gvk: &Gvk) -> Result<Vec<DynamicObject>, ClientError>;
}

/// Writes objects to the Kubernetes API. Objects must carry type information.
#[async_trait::async_trait]
pub trait Writer: Send + Sync {
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;

    async fn delete(&self, obj: &DynamicObject) -> Result<(), ClientError>;
}

// === impl ClientError ===

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_no_match(&self) -> bool {
        matches!(self, Self::NoMatch(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
