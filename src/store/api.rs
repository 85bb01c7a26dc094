//! [`ObjectStore`] backed by the Kubernetes API server.
//!
//! Status is written with a PUT to the `status` subresource, so the stored status is replaced
//! as a whole and keys dropped from a map disappear. Finalizers are written with a merge patch
//! (lists are replaced whole by merge patches). Both writes carry `metadata.resourceVersion`, and
//! the API server rejects them with 409 when the object has changed since it was read.

use async_trait::async_trait;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    core::NamespaceResourceScope,
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::fmt::Debug;
use std::marker::PhantomData;

use super::{object_key, ObjectStore, StoreError};
use crate::constants::CONTROLLER_NAME;

pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> std::fmt::Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn namespaced(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_kube_error<K: Resource<DynamicType = ()>>(
    err: kube::Error,
    namespace: &str,
    name: &str,
) -> StoreError {
    let kind = K::kind(&()).to_string();
    match err {
        kube::Error::Api(ref api_err) if api_err.code == 404 => StoreError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ref api_err) if api_err.code == 409 => StoreError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => StoreError::Api(other),
    }
}

fn resource_version<K: Resource>(obj: &K) -> Result<String, StoreError> {
    obj.meta()
        .resource_version
        .clone()
        .ok_or_else(|| StoreError::Invalid("object has no resourceVersion".to_string()))
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.namespaced(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error::<K>(e, namespace, name))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        let api: Api<K> = match namespace {
            Some(ns) => self.namespaced(ns),
            None => Api::all(self.client.clone()),
        };
        api.list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| map_kube_error::<K>(e, namespace.unwrap_or("*"), "*"))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_key(obj);
        self.namespaced(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error::<K>(e, &namespace, &name))
    }

    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_key(obj);
        resource_version(obj)?;
        let body = serde_json::to_vec(obj)?;
        self.namespaced(&namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| map_kube_error::<K>(e, &namespace, &name))
    }

    async fn replace_finalizers(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_key(obj);
        let version = resource_version(obj)?;
        let finalizers = obj.meta().finalizers.clone().unwrap_or_default();
        let patch = json!({
            "metadata": {
                "resourceVersion": version,
                "finalizers": finalizers,
            },
        });
        self.namespaced(&namespace)
            .patch(&name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error::<K>(e, &namespace, &name))
    }
}
