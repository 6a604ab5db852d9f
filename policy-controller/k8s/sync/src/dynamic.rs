use crate::Error;
use gatekeeper_policy_controller_k8s_api::DynamicObject;
use serde::de::DeserializeOwned;

/// Converts a dynamic object into a typed resource.
pub(crate) fn parse<K: DeserializeOwned>(
    kind: &'static str,
    obj: &DynamicObject,
) -> Result<K, Error> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|source| Error::Parse { kind, source })
}

/// Converts a typed resource back into a dynamic object.
#[cfg(test)]
pub(crate) fn to_dynamic<K: serde::Serialize>(
    kind: &'static str,
    resource: &K,
) -> Result<DynamicObject, Error> {
    serde_json::to_value(resource)
        .and_then(serde_json::from_value)
        .map_err(|source| Error::Parse { kind, source })
}
