use async_trait::async_trait;
use gatekeeper_policy_controller_core::{
    DataClient, DataError, Gvk, ObjectKey, RemoveTarget, Responses,
};
use gatekeeper_policy_controller_k8s_api::DynamicObject;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Target name reported in [`Responses`].
pub const INVENTORY_TARGET: &str = "inventory";

/// An in-memory replica of synced cluster state, usable as the data client
/// when no policy engine is attached.
#[derive(Debug, Default)]
pub struct Inventory {
    objects: RwLock<BTreeMap<Gvk, BTreeMap<ObjectKey, DynamicObject>>>,
}

// === impl Inventory ===

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Option<DynamicObject> {
        self.objects.read().get(gvk)?.get(key).cloned()
    }

    pub fn keys(&self, gvk: &Gvk) -> Vec<ObjectKey> {
        self.objects
            .read()
            .get(gvk)
            .map(|objs| objs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<Gvk> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl DataClient for Inventory {
    async fn add_data(&self, obj: &DynamicObject) -> Result<Responses, DataError> {
        let gvk = Gvk::of(obj).ok_or(DataError::MissingType)?;
        self.objects
            .write()
            .entry(gvk)
            .or_default()
            .insert(ObjectKey::of(obj), obj.clone());
        Ok(Responses::handled_by(INVENTORY_TARGET))
    }

    async fn remove_data(&self, target: &RemoveTarget) -> Result<Responses, DataError> {
        match target {
            RemoveTarget::WipeAll => self.objects.write().clear(),
            RemoveTarget::Object(obj) => {
                let gvk = Gvk::of(obj).ok_or(DataError::MissingType)?;
                let mut objects = self.objects.write();
                if let Some(objs) = objects.get_mut(&gvk) {
                    objs.remove(&ObjectKey::of(obj));
                    if objs.is_empty() {
                        objects.remove(&gvk);
                    }
                }
            }
        }
        Ok(Responses::handled_by(INVENTORY_TARGET))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_policy_controller_core::object;

    #[tokio::test]
    async fn add_remove_wipe() {
        let inventory = Inventory::new();
        let pods = Gvk::new("", "v1", "Pod");
        let nss = Gvk::new("", "v1", "Namespace");
        let a = object::stub(&pods, &ObjectKey::namespaced("ns", "a"));
        let ns = object::stub(&nss, &ObjectKey::cluster("ns"));

        inventory.add_data(&a).await.expect("add");
        inventory.add_data(&ns).await.expect("add");
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory.kinds(), vec![nss.clone(), pods.clone()]);

        inventory
            .remove_data(&RemoveTarget::Object(a))
            .await
            .expect("remove");
        assert_eq!(inventory.kinds(), vec![nss.clone()]);

        inventory
            .remove_data(&RemoveTarget::WipeAll)
            .await
            .expect("wipe");
        assert!(inventory.is_empty());
    }

    #[tokio::test]
    async fn untyped_objects_are_rejected() {
        let inventory = Inventory::new();
        let mut obj = object::stub(&Gvk::new("", "v1", "Pod"), &ObjectKey::cluster("a"));
        obj.types = None;
        let err = inventory.add_data(&obj).await.expect_err("must fail");
        assert!(matches!(err, DataError::MissingType));
    }
}
