use crate::Gvk;
use gatekeeper_policy_controller_k8s_api::{DynamicObject, Resource, ResourceExt, TypeMeta};
use std::fmt;

/// Names an object within its kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

// === impl ObjectKey ===

impl ObjectKey {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Builds an otherwise-empty object carrying only type and identity, enough
/// for data removal.
pub fn stub(gvk: &Gvk, key: &ObjectKey) -> DynamicObject {
    let mut obj = DynamicObject::new(&key.name, &gvk.api_resource());
    obj.metadata.namespace = key.namespace.clone();
    obj
}

/// Sets an object's type information, which list responses may omit.
pub fn set_type(obj: &mut DynamicObject, gvk: &Gvk) {
    obj.types = Some(TypeMeta {
        api_version: gvk.api_version(),
        kind: gvk.kind.clone(),
    });
}

pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Adds the finalizer, returning true if the object changed.
pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.finalizers_mut().push(finalizer.to_string());
    true
}

/// Removes every occurrence of the finalizer, returning true if the object
/// changed.
pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    let finalizers = obj.finalizers_mut();
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_carries_identity() {
        let gvk = Gvk::new("apps", "v1", "Deployment");
        let obj = stub(&gvk, &ObjectKey::namespaced("ns-0", "web"));
        assert_eq!(Gvk::of(&obj), Some(gvk));
        assert_eq!(ObjectKey::of(&obj), ObjectKey::namespaced("ns-0", "web"));
        assert_eq!(ObjectKey::of(&obj).to_string(), "ns-0/web");
    }

    #[test]
    fn finalizer_edits() {
        let mut obj = stub(&Gvk::new("", "v1", "Pod"), &ObjectKey::cluster("pod-0"));
        assert!(!has_finalizer(&obj, "a"));
        assert!(add_finalizer(&mut obj, "a"));
        assert!(!add_finalizer(&mut obj, "a"));
        assert!(add_finalizer(&mut obj, "b"));
        assert!(remove_finalizer(&mut obj, "a"));
        assert!(!remove_finalizer(&mut obj, "a"));
        assert_eq!(obj.finalizers(), &["b".to_string()]);
    }
}
