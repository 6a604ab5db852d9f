use crate::{
    core::{object, ClientError, Gvk, ObjectKey, Reader, Writer},
    k8s::{ApiResource, DynamicObject, GroupVersionKind},
};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    discovery::{self, Scope},
    Client,
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// Reads and writes arbitrary kinds through the Kubernetes API.
///
/// Kinds are resolved through API discovery the first time they are used. A
/// kind that the API server stops serving is forgotten so that it is
/// re-resolved on next use.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    served: Arc<RwLock<HashMap<Gvk, Served>>>,
}

#[derive(Clone, Debug)]
pub(crate) struct Served {
    pub(crate) resource: ApiResource,
    namespaced: bool,
}

// === impl ClusterClient ===

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            served: Default::default(),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub(crate) async fn resolve(&self, gvk: &Gvk) -> Result<Served, ClientError> {
        if let Some(served) = self.served.read().get(gvk) {
            return Ok(served.clone());
        }

        let (resource, caps) = discovery::pinned_kind(&self.client, &GroupVersionKind::from(gvk))
            .await
            .map_err(|error| match error {
                kube::Error::Discovery(_) => ClientError::NoMatch(gvk.clone()),
                kube::Error::Api(ae) if ae.code == 404 => ClientError::NoMatch(gvk.clone()),
                error => ClientError::Other(error.into()),
            })?;
        let served = Served {
            resource,
            namespaced: caps.scope == Scope::Namespaced,
        };
        self.served.write().insert(gvk.clone(), served.clone());
        Ok(served)
    }

    fn forget(&self, gvk: &Gvk) {
        self.served.write().remove(gvk);
    }

    fn api(&self, served: &Served, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if served.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &served.resource)
            }
            _ => Api::all_with(self.client.clone(), &served.resource),
        }
    }

    async fn target(
        &self,
        obj: &DynamicObject,
    ) -> Result<(Gvk, ObjectKey, Api<DynamicObject>), ClientError> {
        let gvk = Gvk::of(obj).ok_or(ClientError::MissingType)?;
        let key = ObjectKey::of(obj);
        let served = self.resolve(&gvk).await?;
        let api = self.api(&served, key.namespace.as_deref());
        Ok((gvk, key, api))
    }

    fn object_error(&self, gvk: &Gvk, key: &ObjectKey, error: kube::Error) -> ClientError {
        match error {
            kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound {
                gvk: gvk.clone(),
                key: key.clone(),
            },
            kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict {
                gvk: gvk.clone(),
                key: key.clone(),
            },
            error => ClientError::Other(error.into()),
        }
    }
}

#[async_trait::async_trait]
impl Reader for ClusterClient {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<DynamicObject, ClientError> {
        let served = self.resolve(gvk).await?;
        let mut obj = self
            .api(&served, key.namespace.as_deref())
            .get(&key.name)
            .await
            .map_err(|error| self.object_error(gvk, key, error))?;
        object::set_type(&mut obj, gvk);
        Ok(obj)
    }

    async fn list(&self, gvk: &Gvk) -> Result<Vec<DynamicObject>, ClientError> {
        let served = self.resolve(gvk).await?;
        let list = self
            .api(&served, None)
            .list(&ListParams::default())
            .await
            .map_err(|error| match error {
                kube::Error::Api(ae) if ae.code == 404 => {
                    self.forget(gvk);
                    ClientError::NoMatch(gvk.clone())
                }
                error => ClientError::Other(error.into()),
            })?;
        Ok(list
            .items
            .into_iter()
            .map(|mut obj| {
                object::set_type(&mut obj, gvk);
                obj
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl Writer for ClusterClient {
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let (gvk, key, api) = self.target(obj).await?;
        let mut updated = api
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|error| self.object_error(&gvk, &key, error))?;
        object::set_type(&mut updated, &gvk);
        Ok(updated)
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let (gvk, key, api) = self.target(obj).await?;
        let data = serde_json::to_vec(obj).map_err(|e| ClientError::Other(e.into()))?;
        let mut updated = api
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|error| self.object_error(&gvk, &key, error))?;
        object::set_type(&mut updated, &gvk);
        Ok(updated)
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<(), ClientError> {
        let (gvk, key, api) = self.target(obj).await?;
        api.delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|error| self.object_error(&gvk, &key, error))?;
        Ok(())
    }
}
